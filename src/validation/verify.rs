//! Block replay verification
//!
//! The CPU replay path: regenerate the quiz the nonce selected, run the same
//! deterministic inference the miner ran, and check that the derived loss
//! matches the header's claim and meets the target. Used by the miner's
//! acceptor and by peers re-validating gossiped blocks.

use num_bigint::BigInt;
use thiserror::Error;

use crate::consensus::{quiz_prompt, Block, ChainReader};
use crate::crypto::loss_from_output;
use crate::inference::{inference_seed, InferenceEngine, InferenceError};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("transaction {index} invalid: {reason}")]
    InvalidTransaction { index: usize, reason: String },
    #[error("invalid loss: header claims {claimed}, replay derived {replayed}")]
    InvalidLoss { claimed: i64, replayed: i64 },
    #[error("target not met: loss {loss} > target {target}")]
    TargetNotMet { loss: i64, target: BigInt },
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Replay a block's proof of inference and verify its transactions.
///
/// The chain reader is part of the verification capability set; the current
/// replay path derives everything from the block itself, but historical
/// headers stay reachable for future epoch-keyed datasets.
pub fn verify_block(
    block: &Block,
    _chain: &dyn ChainReader,
    llm: &dyn InferenceEngine,
) -> Result<(), VerifyError> {
    for (index, tx) in block.transactions.iter().enumerate() {
        tx.verify().map_err(|e| VerifyError::InvalidTransaction {
            index,
            reason: e.to_string(),
        })?;
    }

    let height = block.header.height;
    let prompt = quiz_prompt(height, block.header.nonce);
    let output = llm.infer(&prompt, inference_seed(height))?;
    let loss = loss_from_output(&output);

    if loss != block.header.loss_claim {
        return Err(VerifyError::InvalidLoss {
            claimed: block.header.loss_claim,
            replayed: loss,
        });
    }
    if BigInt::from(loss) > block.header.bits {
        return Err(VerifyError::TargetNotMet {
            loss,
            target: block.header.bits.clone(),
        });
    }
    Ok(())
}
