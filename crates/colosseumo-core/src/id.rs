use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a logical testbed node. Lives in `[0, pool_size)`.
///
/// Serialized as a bare integer, which is what the testbed expects in the
/// `colosseum_id` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one outstanding API call. Unique per gateway instance.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// The id following this one, wrapping at the end of the id space.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Simulation time in seconds.
pub type SimTime = f64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_orders_numerically() {
        let mut ids = vec![NodeId(3), NodeId(0), NodeId(2)];
        ids.sort();
        assert_eq!(ids, vec![NodeId(0), NodeId(2), NodeId(3)]);
    }

    #[test]
    fn node_id_serializes_as_integer() {
        let json = serde_json::to_string(&NodeId(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn transaction_id_wraps() {
        assert_eq!(TransactionId(u64::MAX).next(), TransactionId(0));
        assert_eq!(TransactionId(41).next(), TransactionId(42));
    }
}
