//! Height-gated script rules
//!
//! One ordered table maps activation heights to the script flags they turn
//! on. Every consumer (block connection, mempool admission, block assembly)
//! asks the same table with the height of the block being validated.

use crate::config::ChainParams;
use crate::core::interpreter::ScriptFlags;

/// Flags enforced from genesis
pub const ALWAYS_ACTIVE: ScriptFlags =
    ScriptFlags::P2SH.union(ScriptFlags::CHECKSEQUENCEVERIFY);

/// Policy-only flags layered over consensus for mempool admission
pub const STANDARD_NOT_MANDATORY: ScriptFlags = ScriptFlags::STRICTENC
    .union(ScriptFlags::DERSIG)
    .union(ScriptFlags::LOW_S)
    .union(ScriptFlags::MINIMALDATA)
    .union(ScriptFlags::NULLDUMMY)
    .union(ScriptFlags::DISCOURAGE_UPGRADABLE_NOPS)
    .union(ScriptFlags::CLEANSTACK)
    .union(ScriptFlags::NULLFAIL)
    .union(ScriptFlags::CHECKLOCKTIMEVERIFY)
    .union(ScriptFlags::CHECKSEQUENCEVERIFY);

#[derive(Debug, Clone)]
pub struct SoftForkGate {
    /// (activation height, flags), ascending by height
    deployments: Vec<(u32, ScriptFlags)>,
}

impl SoftForkGate {
    pub fn new(params: &ChainParams) -> Self {
        let mut deployments = vec![
            (params.dersig_height, ScriptFlags::DERSIG),
            (params.cltv_height, ScriptFlags::CHECKLOCKTIMEVERIFY),
        ];
        deployments.sort_by_key(|(height, _)| *height);
        Self { deployments }
    }

    /// Consensus flags for a block at `height`
    pub fn flags_at(&self, height: u32) -> ScriptFlags {
        self.deployments
            .iter()
            .take_while(|(activation, _)| *activation <= height)
            .fold(ALWAYS_ACTIVE, |flags, (_, delta)| flags | *delta)
    }

    /// Mempool flags for a transaction that would be mined at `next_height`
    pub fn standard_flags(&self, next_height: u32) -> ScriptFlags {
        self.flags_at(next_height) | STANDARD_NOT_MANDATORY
    }
}
