use std::time::Duration;

use decider::{DeciderConfig, DecisionContext, DeliveryError, ExposureEvent};

pub fn main() -> decider::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("decider")).init();

    let path = std::env::var("DECIDER_DEFINITIONS")
        .unwrap_or_else(|_| "tests/data/experiments.json".to_owned());

    // Wait up to 5 seconds for the sidecar to write the definitions file.
    let decider = DeciderConfig::new()
        .path(path)
        .timeout(Duration::from_secs(5))
        .backoff(Duration::from_millis(100))
        .exposure_logger(|event: ExposureEvent| -> Result<(), DeliveryError> {
            let json =
                serde_json::to_string(&event).map_err(|err| DeliveryError::new(err.to_string()))?;
            println!("Exposure: {json}");
            Ok(())
        })
        .to_decider()?;

    let request = decider.with_context(
        DecisionContext::new()
            .with("user_id", "t2_abc")
            .with("country_code", "US"),
    );

    let variant = request.get_variant("foo", None);
    println!("Variant: {:?}", variant);

    let dark_mode = request
        .get_bool("dark_mode")
        // default value
        .unwrap_or(false);
    println!("Dark mode: {:?}", dark_mode);

    drop(request);
    println!("Stats: {:?}", decider.stats());

    decider.shutdown()
}
