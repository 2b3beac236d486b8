/// Session operations observed by the instrumentation layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Init,
    Unload,
    Reload,
    ResetChat,
    Prefill,
    Decode,
    GetMessage,
    Stopped,
    RuntimeStatsText,
    VerboseRuntimeStatsText,
    Evaluate,
}

impl Operation {
    /// Operations whose events carry a sequence number.
    pub const COUNTED: [Operation; 7] = [
        Operation::Unload,
        Operation::Reload,
        Operation::ResetChat,
        Operation::Prefill,
        Operation::Decode,
        Operation::GetMessage,
        Operation::Stopped,
    ];

    pub fn is_counted(self) -> bool {
        self.counter_slot().is_some()
    }

    fn counter_slot(self) -> Option<usize> {
        Self::COUNTED.iter().position(|op| *op == self)
    }
}

/// Per-operation invocation counters.
///
/// Uncounted operations always read as `None` and are ignored by [`advance`](Self::advance).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationCounters {
    values: [u64; Operation::COUNTED.len()],
}

impl OperationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next invocation of `op` will be labeled with.
    pub fn current(&self, op: Operation) -> Option<u64> {
        op.counter_slot().map(|slot| self.values[slot])
    }

    pub fn advance(&mut self, op: Operation) {
        if let Some(slot) = op.counter_slot() {
            self.values[slot] += 1;
        }
    }

    pub fn reset(&mut self) {
        self.values = Default::default();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Operation, u64)> + '_ {
        Operation::COUNTED.iter().copied().zip(self.values.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[rstest]
    #[case(Operation::ResetChat, "reset_chat")]
    #[case(Operation::GetMessage, "get_message")]
    #[case(Operation::VerboseRuntimeStatsText, "verbose_runtime_stats_text")]
    #[case(Operation::Init, "init")]
    fn operation_names(#[case] op: Operation, #[case] name: &str) {
        assert_eq!(op.to_string(), name);
        assert_eq!(Operation::from_str(name).unwrap(), op);
    }

    #[test]
    fn exactly_seven_operations_are_counted() {
        let counted: Vec<_> = Operation::iter().filter(|op| op.is_counted()).collect();
        assert_eq!(counted, Operation::COUNTED.to_vec());
        assert!(!Operation::Evaluate.is_counted());
        assert_eq!(OperationCounters::new().current(Operation::Evaluate), None);
    }

    #[test]
    fn advance_and_reset() {
        let mut counters = OperationCounters::new();
        counters.advance(Operation::Prefill);
        counters.advance(Operation::Prefill);
        counters.advance(Operation::Decode);
        counters.advance(Operation::Evaluate);
        assert_eq!(counters.current(Operation::Prefill), Some(2));
        assert_eq!(counters.current(Operation::Decode), Some(1));
        assert_eq!(counters.current(Operation::Stopped), Some(0));

        counters.reset();
        assert!(counters.iter().all(|(_, value)| value == 0));
    }
}
