//! Shared block types for the loader pipeline.

use serde::{Deserialize, Serialize};

// ─── LightBlock ───────────────────────────────────────────────────────────────

/// The minimal block record kept in the chain window.
///
/// Enough for hash-linkage validation and for the reorganisation mapper, which
/// only needs transaction ids to suspend rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightBlock {
    /// Block height.
    pub height: u64,
    /// Block hash.
    pub hash: String,
    /// Hash of the parent block (empty for genesis).
    #[serde(default)]
    pub previousblockhash: String,
    /// Transaction ids, in block order.
    pub tx: Vec<String>,
    /// Serialized size of the full block in bytes.
    #[serde(default)]
    pub size: u64,
}

impl LightBlock {
    /// Returns `true` if `self` directly follows `parent` (height and hash link).
    pub fn extends(&self, parent: &LightBlock) -> bool {
        self.height == parent.height + 1 && self.previousblockhash == parent.hash
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A transaction input. Coinbase inputs carry neither `txid` nor `vout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TxInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Output index within the transaction.
    pub n: u32,
    /// Value in the chain's smallest unit.
    pub value: u64,
    /// Hex-encoded locking script.
    #[serde(default, rename = "scriptPubKey", skip_serializing_if = "Option::is_none")]
    pub script_pub_key: Option<String>,
}

/// A transaction as delivered by the block supplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
}

/// A full block as delivered by the block supplier and seen by `on_load`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    #[serde(default)]
    pub previousblockhash: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub tx: Vec<Transaction>,
}

impl Block {
    /// Project to the light form kept by the chain window.
    pub fn to_light(&self) -> LightBlock {
        LightBlock {
            height: self.height,
            hash: self.hash.clone(),
            previousblockhash: self.previousblockhash.clone(),
            tx: self.tx.iter().map(|t| t.txid.clone()).collect(),
            size: self.size,
        }
    }
}

// ─── BlockStats ───────────────────────────────────────────────────────────────

/// Per-height summary returned by the chain source provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub height: u64,
    pub blockhash: String,
    pub total_size: u64,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
