use crate::store::PortRange;

/// A pair of bounds that does not form a legal NodePort sub-range.
#[derive(Debug, thiserror::Error)]
#[error("invalid port range {min}-{max}: bounds must satisfy 30000 <= min <= max <= 32767")]
pub struct InvalidRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum RangeParseError {
    #[error("expected \"<min>-<max>\"")]
    Format,

    #[error("port bound is not a number: {0}")]
    Number(#[from] std::num::ParseIntError),

    #[error(transparent)]
    Bounds(#[from] InvalidRange),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parse configuration: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("namespace {namespace} appears more than once in the configuration")]
    DuplicateNamespace { namespace: String },

    #[error(
        "port range {first_range} of namespace {first} overlaps with {second_range} of namespace {second}"
    )]
    Overlap {
        first: String,
        first_range: PortRange,
        second: String,
        second_range: PortRange,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("namespace {namespace} is already registered")]
    AlreadyExists { namespace: String },

    #[error("namespace {namespace} has no configured port range")]
    UnknownNamespace { namespace: String },

    #[error("port {port} is outside range {range} of namespace {namespace}")]
    OutOfRange {
        namespace: String,
        port: u16,
        range: PortRange,
    },

    #[error("port {port} is already reserved in namespace {namespace}")]
    Taken { namespace: String, port: u16 },

    #[error("port {port} is already allocated in namespace {namespace}")]
    DoubleAllocation { namespace: String, port: u16 },

    #[error("no free ports left in range {range} of namespace {namespace}")]
    Exhausted {
        namespace: String,
        range: PortRange,
    },
}
