//! Bridge configuration properties.

/// Tunable bridge behaviour, read with [`Bridge::property`](crate::Bridge::property).
///
/// Boolean properties use `0` for off and any other value for on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeProperty {
    /// Run the cycle collector automatically after boundary calls.
    AutoCollect,
    /// Allocations between automatic collections.
    CollectThreshold,
    /// Report live native instances when the bridge is dropped.
    LeakWarnings,
    /// Allow the second, converting pass of overload resolution.
    ImplicitConversions,
}

impl BridgeProperty {
    pub const ALL: [BridgeProperty; 4] = [
        BridgeProperty::AutoCollect,
        BridgeProperty::CollectThreshold,
        BridgeProperty::LeakWarnings,
        BridgeProperty::ImplicitConversions,
    ];

    pub fn default_value(&self) -> usize {
        match self {
            BridgeProperty::AutoCollect => 1,
            BridgeProperty::CollectThreshold => 100,
            BridgeProperty::LeakWarnings => 1,
            BridgeProperty::ImplicitConversions => 1,
        }
    }
}
