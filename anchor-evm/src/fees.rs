use passport_anchor_service::FeeOverrides;

/// Wei per gwei
pub const GWEI: u128 = 1_000_000_000;

/// Fee strategy for anchor transactions.
///
/// Node estimates on Polygon are often too low to be included promptly, so every estimate is
/// multiplied and clamped to a floor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeeConfig {
    /// Factor applied to every node estimate
    pub multiplier: u128,
    /// Minimum EIP-1559 priority fee in wei
    pub priority_floor: u128,
    /// Minimum EIP-1559 max fee in wei
    pub max_fee_floor: u128,
    /// Minimum legacy gas price in wei
    pub legacy_floor: u128,
    /// Required headroom of the max fee over the priority fee in wei
    pub margin: u128,
    /// Estimated max fees below this are not trusted and the legacy path is used instead
    pub eip1559_min_max_fee: u128,
    /// Gas limit of the anchor call
    pub gas_limit: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            multiplier: 2,
            priority_floor: 30 * GWEI,
            max_fee_floor: 60 * GWEI,
            legacy_floor: 60 * GWEI,
            margin: 2 * GWEI,
            eip1559_min_max_fee: 5 * GWEI,
            gas_limit: 300_000,
        }
    }
}

/// Fee estimates read from the node. A value the node could not provide is `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeSnapshot {
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub gas_price: Option<u128>,
}

/// Fees a transaction is sent with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeePlan {
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
    Legacy {
        gas_price: u128,
    },
}

impl FeeConfig {
    /// Fees for a transaction given the node's estimates.
    pub fn plan(&self, snapshot: &FeeSnapshot) -> FeePlan {
        let max_fee = snapshot.max_fee_per_gas.unwrap_or_default();
        if max_fee >= self.eip1559_min_max_fee {
            let priority = snapshot
                .max_priority_fee_per_gas
                .unwrap_or_default()
                .saturating_mul(self.multiplier)
                .max(self.priority_floor);
            let max_fee = max_fee
                .saturating_mul(self.multiplier)
                .max(self.max_fee_floor)
                .max(priority.saturating_add(self.margin));
            FeePlan::Eip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority,
            }
        } else {
            FeePlan::Legacy {
                gas_price: snapshot
                    .gas_price
                    .unwrap_or_default()
                    .saturating_mul(self.multiplier)
                    .max(self.legacy_floor),
            }
        }
    }

    /// Fees for a transaction with caller overrides applied. An overridden gas price forces the
    /// legacy path, overridden EIP-1559 values are used as given.
    pub fn plan_with_overrides(&self, snapshot: &FeeSnapshot, overrides: &FeeOverrides) -> FeePlan {
        if let Some(gas_price) = overrides.gas_price {
            return FeePlan::Legacy { gas_price };
        }
        match (
            self.plan(snapshot),
            overrides.max_fee_per_gas,
            overrides.max_priority_fee_per_gas,
        ) {
            (plan, None, None) => plan,
            (
                FeePlan::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
                max_fee,
                priority,
            ) => FeePlan::Eip1559 {
                max_fee_per_gas: max_fee.unwrap_or(max_fee_per_gas),
                max_priority_fee_per_gas: priority.unwrap_or(max_priority_fee_per_gas),
            },
            (FeePlan::Legacy { gas_price }, max_fee, priority) => {
                let max_fee_per_gas = max_fee.unwrap_or(gas_price);
                FeePlan::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: priority
                        .unwrap_or(self.priority_floor)
                        .min(max_fee_per_gas),
                }
            }
        }
    }

    pub fn gas_limit(&self, overrides: &FeeOverrides) -> u64 {
        overrides.gas_limit.unwrap_or(self.gas_limit)
    }
}
