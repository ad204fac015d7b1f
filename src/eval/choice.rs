/// A specific choice of operand made by a `min` or `max` clause
///
/// Recorded during interval evaluation and consumed by the pruning pass:
/// when one operand's interval is strictly on the winning side over the
/// whole input region, the other operand's subtree can be disabled.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Choice {
    /// Both operands can still win; nothing may be pruned
    #[default]
    Both,
    /// The left-hand operand always wins
    Left,
    /// The right-hand operand always wins
    Right,
}
