use thiserror::Error;
use crate::protocol::codec_error::CodecError;
use crate::protocol::frame::Serial;
use crate::protocol::packet::Packet;

/// What was sent, for error reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdent {
    pub serial: Serial,
    pub pkt_type: u16,
    pub source: u32,
    pub sequence: u8,
}

impl std::fmt::Display for RequestIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "serial={} pkt_type={} source={} sequence={}", self.serial, self.pkt_type, self.source, self.sequence)
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("timed out waiting for a reply ({ident}){}", .last_error.as_ref().map(|e| format!(": {}", e)).unwrap_or_default())]
    TimedOut {
        ident: RequestIdent,
        /// replies that arrived before giving up
        partial: Vec<Packet>,
        /// the last transport failure, if attempts failed
        last_error: Option<String>,
    },

    #[error("acknowledged but no reply arrived ({ident})")]
    TimedOutAfterAck {
        ident: RequestIdent,
        partial: Vec<Packet>,
    },

    #[error("message was cancelled")]
    Cancelled,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{} errors: {}", .0.len(), .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    RunErrors(Vec<TransportError>),
}

/// Errors are considered duplicates if they report the same thing, regardless of partial results
impl PartialEq for TransportError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl TransportError {
    /// Combines the errors of a fan-out: `None` if there were none, the error itself if there was
    ///  exactly one distinct error, and [TransportError::RunErrors] otherwise
    pub fn aggregate(errors: impl IntoIterator<Item = TransportError>) -> Option<TransportError> {
        let mut distinct: Vec<TransportError> = Vec::new();
        for e in errors {
            match e {
                TransportError::RunErrors(nested) => {
                    for n in nested {
                        if !distinct.contains(&n) {
                            distinct.push(n);
                        }
                    }
                }
                e => {
                    if !distinct.contains(&e) {
                        distinct.push(e);
                    }
                }
            }
        }

        match distinct.len() {
            0 => None,
            1 => distinct.pop(),
            _ => Some(TransportError::RunErrors(distinct)),
        }
    }

    pub fn partial_results(&self) -> &[Packet] {
        match self {
            TransportError::TimedOut { partial, .. } => partial,
            TransportError::TimedOutAfterAck { partial, .. } => partial,
            _ => &[],
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn timed_out(sequence: u8) -> TransportError {
        TransportError::TimedOut {
            ident: RequestIdent { serial: Serial([1, 2, 3, 4, 5, 6]), pkt_type: 2, source: 9, sequence },
            partial: vec![],
            last_error: None,
        }
    }

    #[test]
    fn test_aggregate_none() {
        assert!(TransportError::aggregate(vec![]).is_none());
    }

    #[test]
    fn test_aggregate_single_distinct_error_is_raised_directly() {
        let result = TransportError::aggregate(vec![timed_out(1), timed_out(1)]);
        assert_eq!(result, Some(timed_out(1)));
    }

    #[test]
    fn test_aggregate_deduplicates() {
        let result = TransportError::aggregate(vec![timed_out(1), TransportError::Cancelled, timed_out(1), timed_out(2)]);
        match result {
            Some(TransportError::RunErrors(errors)) => assert_eq!(errors, vec![timed_out(1), TransportError::Cancelled, timed_out(2)]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_flattens_nested() {
        let nested = TransportError::RunErrors(vec![timed_out(1), timed_out(2)]);
        let result = TransportError::aggregate(vec![nested, timed_out(2)]);
        assert!(matches!(result, Some(TransportError::RunErrors(ref errors)) if errors.len() == 2));
    }

    #[test]
    fn test_display() {
        assert_eq!(timed_out(7).to_string(), "timed out waiting for a reply (serial=010203040506 pkt_type=2 source=9 sequence=7)");
    }
}
