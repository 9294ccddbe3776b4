//! Definitions file parser.
//!
//! The document must be a JSON object mapping entry names to definitions. Every entry is
//! validated on its own: an invalid entry is dropped and reported as a [`DefinitionWarning`]
//! while the rest of the document still loads. Only a document that is not a JSON object at all
//! fails the whole load.
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{
    de::{IgnoredAny, MapAccess, Visitor},
    Deserialize, Deserializer,
};

use crate::{
    definitions::{
        DynamicValue, DynamicValueType, ExperimentDefinition, ExperimentKind, HoldoutGroup,
        MutexGroup, MutexMember, Override, Timestamp, Variant,
    },
    targeting::{Targeting, TargetingError, TargetingWire, Value},
    Result, Snapshot,
};

/// Sizes may exceed 1.0 by this much to absorb floating point error in generated files.
const SIZE_TOLERANCE: f64 = 1e-6;

const DEFAULT_BUCKET_VAL: &str = "user_id";

/// Reason a single definition was dropped.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DefinitionError {
    /// The `type` field is missing or names an unknown kind.
    #[error("unknown definition type {0:?}")]
    UnknownKind(String),
    /// The entry does not match the expected shape.
    #[error("malformed definition: {0}")]
    Malformed(String),
    /// The same name appears more than once in the document.
    #[error("duplicate definition name")]
    DuplicateName,
    /// The `name` field disagrees with the key the entry is stored under.
    #[error("name field {0:?} does not match the entry key")]
    NameMismatch(String),
    /// A size is not a number in `[0, 1]`.
    #[error("size of {name:?} is not in [0, 1]: {size}")]
    InvalidSize {
        /// Variant or member the size belongs to.
        name: String,
        /// Offending size.
        size: f64,
    },
    /// Sizes sum to more than 1.0, or a variant reaches past the end of the hash space.
    #[error("sizes sum to {0}, which exceeds 1.0")]
    SizesExceedOne(f64),
    /// A variant's `range_end` is before its `range_start`.
    #[error("range of {name:?} ends at {end}, before its start {start}")]
    InvertedRange {
        /// Offending variant.
        name: String,
        /// Declared `range_start`.
        start: f64,
        /// Declared `range_end`.
        end: f64,
    },
    /// Two variants claim the same part of the hash space.
    #[error("range of {0:?} overlaps another variant")]
    OverlappingVariants(String),
    /// Two variants (or mutex members) share a name.
    #[error("{0:?} is listed more than once")]
    DuplicateVariant(String),
    /// The targeting rule failed to compile.
    #[error("invalid targeting: {0}")]
    Targeting(#[from] TargetingError),
    /// An override forces a variant that is not declared.
    #[error("override references undeclared variant {0:?}")]
    UnknownOverrideVariant(String),
    /// A dynamic config value is missing or does not match its `value_type`.
    #[error("missing or mistyped dynamic config value")]
    InvalidValue,
    /// A holdout has no `size`.
    #[error("holdout is missing size")]
    MissingSize,
    /// `start_ts`/`stop_ts` is out of range.
    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),
    /// A `mutex_member` does not name its group.
    #[error("mutex member is missing mutex_group")]
    MissingMutexGroup,
    /// Only `mutex_member` entries may reference a mutex group.
    #[error("mutex_group is only allowed on mutex_member entries")]
    UnexpectedMutexGroup,
    /// Holdouts cannot belong to other groups.
    #[error("holdouts cannot belong to a holdout or mutex group")]
    NestedGroup,
    /// `holdout_group` does not name a holdout, or an experiment with a `holdout` variant.
    #[error("unknown holdout group {0:?}")]
    UnknownHoldout(String),
    /// `mutex_group` does not name a valid group listing this experiment.
    #[error("unknown mutex group {0:?} or experiment not listed as its member")]
    UnknownMutexGroup(String),
}

/// A definition dropped while loading, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionWarning {
    /// Name of the dropped entry.
    pub name: String,
    /// Why it was dropped.
    pub error: DefinitionError,
}

impl fmt::Display for DefinitionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

/// Top-level document, keeping entries in document order and keeping duplicate keys (which a
/// `HashMap` would silently collapse).
struct RawDocument(Vec<(String, serde_json::Value)>);

impl<'de> Deserialize<'de> for RawDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RawDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of experiment definitions")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<RawDocument, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, serde_json::Value>()? {
                    entries.push(entry);
                }
                Ok(RawDocument(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// A single entry as written in the definitions file.
///
/// Bucketing details may also be nested under `experiment`, as exported by the experiment
/// management service. Unknown fields reject the entry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntryWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    bucket_seed: Option<String>,
    #[serde(default)]
    bucket_val: Option<String>,
    #[serde(default)]
    variants: Vec<VariantWire>,
    #[serde(default)]
    targeting: Option<TargetingWire>,
    #[serde(default, alias = "parent_hg_name")]
    holdout_group: Option<String>,
    #[serde(default)]
    mutex_group: Option<String>,
    #[serde(default)]
    overrides: Vec<Override>,
    #[serde(default)]
    start_ts: Option<i64>,
    #[serde(default)]
    stop_ts: Option<i64>,
    #[serde(default)]
    emit_event: Option<bool>,
    /// Holdout size.
    #[serde(default)]
    size: Option<f64>,
    /// Mutex group members.
    #[serde(default)]
    members: Vec<MutexMember>,
    #[serde(default)]
    value_type: Option<DynamicValueType>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    experiment: Option<ExperimentWire>,
}

/// The nested `experiment` object of an entry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExperimentWire {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    variants: Vec<VariantWire>,
    #[serde(default)]
    bucket_seed: Option<String>,
    #[serde(default)]
    bucket_val: Option<String>,
    #[serde(default)]
    targeting: Option<TargetingWire>,
    #[serde(default)]
    overrides: Vec<Override>,
    // Exported alongside the variants but not used for bucketing.
    #[serde(default, rename = "experiment_version")]
    _experiment_version: Option<IgnoredAny>,
    #[serde(default, rename = "shuffle_version")]
    _shuffle_version: Option<IgnoredAny>,
    #[serde(default, rename = "log_bucketing")]
    _log_bucketing: Option<IgnoredAny>,
}

/// A variant is declared either by `size`, starting where the previous variant ended, or by an
/// explicit `[range_start, range_end)`. The range wins when both are present.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariantWire {
    name: String,
    #[serde(default)]
    size: Option<f64>,
    #[serde(default)]
    range_start: Option<f64>,
    #[serde(default)]
    range_end: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

enum Entry {
    Experiment(ExperimentDefinition),
    MutexGroup(MutexGroup),
}

/// Parse a definitions document into a [`Snapshot`].
///
/// Fails only if `bytes` is not a JSON object. Invalid entries are dropped and listed in
/// [`Snapshot::warnings`].
pub(crate) fn parse(bytes: &[u8]) -> Result<Snapshot> {
    let RawDocument(entries) = serde_json::from_slice(bytes)?;

    let mut warnings = Vec::new();
    let mut experiments = HashMap::new();
    let mut mutex_groups = HashMap::new();
    let mut seen = HashSet::new();

    for (name, value) in entries {
        if !seen.insert(name.clone()) {
            warnings.push(DefinitionWarning {
                name,
                error: DefinitionError::DuplicateName,
            });
            continue;
        }

        match compile_entry(&name, value) {
            Ok(Entry::Experiment(definition)) => {
                experiments.insert(name, definition);
            }
            Ok(Entry::MutexGroup(group)) => {
                mutex_groups.insert(name, group);
            }
            Err(error) => warnings.push(DefinitionWarning { name, error }),
        }
    }

    validate_references(&mut experiments, &mutex_groups, &mut warnings);

    for warning in &warnings {
        log::warn!(target: "decider",
                   experiment = warning.name.as_str();
                   "dropping invalid definition: {}", warning.error);
    }

    Ok(Snapshot::new(
        experiments,
        mutex_groups,
        warnings,
        md5::compute(bytes).0,
    ))
}

fn compile_entry(
    name: &str,
    value: serde_json::Value,
) -> std::result::Result<Entry, DefinitionError> {
    let mut wire: EntryWire =
        serde_json::from_value(value).map_err(|err| DefinitionError::Malformed(err.to_string()))?;
    if let Some(nested) = wire.experiment.take() {
        merge_nested(&mut wire, nested)?;
    }

    if let Some(declared) = &wire.name {
        if declared != name {
            return Err(DefinitionError::NameMismatch(declared.clone()));
        }
    }

    let kind_name = std::mem::take(&mut wire.kind);
    let kind = match kind_name.as_str() {
        "simple" | "range_variant" | "r2" => ExperimentKind::Simple,
        "rollout" | "feature_rollout" => ExperimentKind::Rollout,
        "mutex_member" => ExperimentKind::MutexMember,
        "holdout" => {
            let size = wire.size.ok_or(DefinitionError::MissingSize)?;
            check_size(name, size)?;
            ExperimentKind::Holdout(HoldoutGroup { size })
        }
        "dynamic_config" => {
            let value = wire.value.take().ok_or(DefinitionError::InvalidValue)?;
            let value = DynamicValue::from_json(value, wire.value_type)
                .ok_or(DefinitionError::InvalidValue)?;
            ExperimentKind::DynamicConfig(value)
        }
        "mutex_group" => return compile_mutex_group(name, wire).map(Entry::MutexGroup),
        other => return Err(DefinitionError::UnknownKind(other.to_owned())),
    };

    match (&kind, &wire.mutex_group) {
        (ExperimentKind::MutexMember, None) => return Err(DefinitionError::MissingMutexGroup),
        (ExperimentKind::Simple | ExperimentKind::Rollout, Some(_)) => {
            return Err(DefinitionError::UnexpectedMutexGroup)
        }
        (ExperimentKind::Holdout(_), mutex_group)
            if mutex_group.is_some() || wire.holdout_group.is_some() =>
        {
            return Err(DefinitionError::NestedGroup)
        }
        _ => {}
    }

    let has_variants = kind.has_variants();
    let variants = if has_variants {
        compile_variants(wire.variants)?
    } else {
        Vec::new()
    };

    let overrides = if has_variants {
        if let Some(o) = wire
            .overrides
            .iter()
            .find(|o| !variants.iter().any(|v| v.name == o.variant))
        {
            return Err(DefinitionError::UnknownOverrideVariant(o.variant.clone()));
        }
        wire.overrides
    } else {
        Vec::new()
    };

    let targeting = match wire.targeting {
        Some(targeting) if has_variants => Some(Targeting::compile(targeting)?),
        _ => None,
    };

    let emit_event = wire
        .emit_event
        .unwrap_or(!matches!(kind, ExperimentKind::Rollout));

    Ok(Entry::Experiment(ExperimentDefinition {
        name: name.to_owned(),
        id: wire.id,
        version: wire.version.map(|v| match v {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
        }),
        owner: wire.owner,
        kind,
        enabled: wire.enabled,
        bucket_seed: wire.bucket_seed.unwrap_or_else(|| name.to_owned()),
        bucket_val: wire
            .bucket_val
            .unwrap_or_else(|| DEFAULT_BUCKET_VAL.to_owned()),
        variants,
        targeting,
        holdout_group: wire.holdout_group,
        mutex_group: wire.mutex_group,
        overrides,
        start_ts: wire.start_ts.map(to_timestamp).transpose()?,
        stop_ts: wire.stop_ts.map(to_timestamp).transpose()?,
        emit_event,
    }))
}

/// Move the fields of the nested `experiment` object into the entry. Each field may be declared
/// at one level only.
fn merge_nested(
    wire: &mut EntryWire,
    nested: ExperimentWire,
) -> std::result::Result<(), DefinitionError> {
    fn merge<T>(
        field: &str,
        outer: &mut Option<T>,
        inner: Option<T>,
    ) -> std::result::Result<(), DefinitionError> {
        if inner.is_none() {
            return Ok(());
        }
        if outer.is_some() {
            return Err(DefinitionError::Malformed(format!(
                "{field} is declared both in the entry and in its experiment"
            )));
        }
        *outer = inner;
        Ok(())
    }

    fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
        Some(items).filter(|items| !items.is_empty())
    }

    let mut variants = non_empty(std::mem::take(&mut wire.variants));
    merge("variants", &mut variants, non_empty(nested.variants))?;
    wire.variants = variants.unwrap_or_default();

    let mut overrides = non_empty(std::mem::take(&mut wire.overrides));
    merge("overrides", &mut overrides, non_empty(nested.overrides))?;
    wire.overrides = overrides.unwrap_or_default();

    merge("bucket_seed", &mut wire.bucket_seed, nested.bucket_seed)?;
    merge("bucket_val", &mut wire.bucket_val, nested.bucket_val)?;
    merge("targeting", &mut wire.targeting, nested.targeting)?;

    // The nested copies of id and name repeat the entry's own.
    match (wire.id, nested.id) {
        (Some(outer), Some(inner)) if outer != inner => {
            return Err(DefinitionError::Malformed(format!(
                "experiment id {inner} does not match entry id {outer}"
            )))
        }
        (None, inner) => wire.id = inner,
        _ => {}
    }
    if nested.name.is_some() && wire.name.is_none() {
        wire.name = nested.name;
    }
    Ok(())
}

fn compile_variants(
    wire: Vec<VariantWire>,
) -> std::result::Result<Vec<Variant>, DefinitionError> {
    let mut variants = Vec::with_capacity(wire.len());
    let mut next_start = 0.0;
    for VariantWire {
        name,
        size,
        range_start,
        range_end,
    } in wire
    {
        let (range_start, size) = match (range_start, range_end, size) {
            (Some(start), Some(end), _) => {
                check_size(&name, start)?;
                check_size(&name, end)?;
                if end < start {
                    return Err(DefinitionError::InvertedRange { name, start, end });
                }
                (start, end - start)
            }
            (None, None, Some(size)) => {
                check_size(&name, size)?;
                (next_start, size)
            }
            _ => {
                return Err(DefinitionError::Malformed(format!(
                    "variant {name:?} needs a size or both range bounds"
                )))
            }
        };
        next_start = range_start + size;
        if next_start > 1.0 + SIZE_TOLERANCE {
            return Err(DefinitionError::SizesExceedOne(next_start));
        }
        variants.push(Variant {
            name,
            size,
            range_start,
        });
    }

    check_sizes(variants.iter().map(|v| (&*v.name, v.size)))?;

    let mut occupied: Vec<&Variant> = variants.iter().filter(|v| v.size > 0.0).collect();
    occupied.sort_by(|a, b| a.range_start.total_cmp(&b.range_start));
    if let Some(pair) = occupied
        .windows(2)
        .find(|pair| pair[0].range_start + pair[0].size > pair[1].range_start + SIZE_TOLERANCE)
    {
        return Err(DefinitionError::OverlappingVariants(pair[1].name.clone()));
    }

    Ok(variants)
}

fn compile_mutex_group(
    name: &str,
    wire: EntryWire,
) -> std::result::Result<MutexGroup, DefinitionError> {
    check_sizes(wire.members.iter().map(|m| (&*m.experiment, m.size)))?;
    Ok(MutexGroup {
        name: name.to_owned(),
        bucket_seed: wire.bucket_seed.unwrap_or_else(|| name.to_owned()),
        members: wire.members,
    })
}

fn check_size(name: &str, size: f64) -> std::result::Result<(), DefinitionError> {
    if (0.0..=1.0).contains(&size) {
        Ok(())
    } else {
        Err(DefinitionError::InvalidSize {
            name: name.to_owned(),
            size,
        })
    }
}

fn check_sizes<'a>(
    sizes: impl Iterator<Item = (&'a str, f64)>,
) -> std::result::Result<(), DefinitionError> {
    let mut names = HashSet::new();
    let mut total = 0.0;
    for (name, size) in sizes {
        check_size(name, size)?;
        if !names.insert(name) {
            return Err(DefinitionError::DuplicateVariant(name.to_owned()));
        }
        total += size;
    }
    if total > 1.0 + SIZE_TOLERANCE {
        return Err(DefinitionError::SizesExceedOne(total));
    }
    Ok(())
}

fn to_timestamp(seconds: i64) -> std::result::Result<Timestamp, DefinitionError> {
    DateTime::<Utc>::from_timestamp(seconds, 0).ok_or(DefinitionError::InvalidTimestamp(seconds))
}

/// Drop experiments whose group references do not resolve.
fn validate_references(
    experiments: &mut HashMap<String, ExperimentDefinition>,
    mutex_groups: &HashMap<String, MutexGroup>,
    warnings: &mut Vec<DefinitionWarning>,
) {
    let holdouts: HashSet<String> = experiments
        .values()
        .filter(|d| match d.kind {
            ExperimentKind::Holdout(_) => true,
            ExperimentKind::Simple | ExperimentKind::Rollout => {
                d.holdout_group.is_none() && d.has_variant(HoldoutGroup::HOLDOUT_VARIANT)
            }
            _ => false,
        })
        .map(|d| d.name.clone())
        .collect();

    experiments.retain(|name, definition| {
        let error = if let Some(holdout) = definition
            .holdout_group
            .as_ref()
            .filter(|h| !holdouts.contains(*h))
        {
            Some(DefinitionError::UnknownHoldout(holdout.clone()))
        } else if let Some(group) = definition.mutex_group.as_ref().filter(|g| {
            !mutex_groups
                .get(*g)
                .is_some_and(|group| group.contains(name))
        }) {
            Some(DefinitionError::UnknownMutexGroup(group.clone()))
        } else {
            None
        };

        match error {
            Some(error) => {
                warnings.push(DefinitionWarning {
                    name: name.clone(),
                    error,
                });
                false
            }
            None => true,
        }
    });
}
