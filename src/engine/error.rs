#[derive(Debug)]
pub enum EngineError {
    /// No lot registered under the given name.
    UnknownLot(String),
    /// Provisioning a lot whose key already exists.
    LotExists(String),
    /// Slot number outside the lot's pool.
    UnknownSlot(u32),
    /// Malformed request, rejected before any state change.
    Validation(&'static str),
    /// Every slot conflicts with the candidate interval. Expected
    /// outcome, not a fault.
    NoAvailability,
    LimitExceeded(&'static str),
    /// WAL append failed; the transaction was not applied.
    Persistence(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UnknownLot(name) => write!(f, "unknown lot: {name}"),
            EngineError::LotExists(key) => write!(f, "lot already exists: {key}"),
            EngineError::UnknownSlot(n) => write!(f, "no such slot: {n}"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NoAvailability => {
                write!(f, "no slot available for the requested interval")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Persistence(e) => write!(f, "persistence error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
