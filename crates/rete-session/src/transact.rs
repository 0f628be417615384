// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Transactional interceptor.
//!
//! Before a scope commits, every context match is validated against the
//! snapshot the transaction would publish. A rejected match aborts the
//! attempt. When the network has not yet processed the transaction's base
//! snapshot the verdict is inconclusive and the attempt "spins": it waits
//! for the coordinator to catch up and starts over from a fresh prepare.
use rete_core::store::TxBuilder;
use rete_core::{validate_all, Change, InvalidationReason, UnsatisfiedMatch, ValidationResult};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::scope::MatchScope;

/// A transaction that passed validation and was published.
#[derive(Clone, Debug)]
pub struct Committed {
    /// The published change. Empty novelty when the transaction was a no-op.
    pub change: Change,
    /// Inconclusive validations before the commit.
    pub spins: u32,
}

impl MatchScope {
    /// Commits the transaction built by `build` if the context matches
    /// survive it.
    ///
    /// `build` may run several times: after a commit conflict and after each
    /// spin. On success the call also waits until the coordinator has
    /// processed the new snapshot, so later reads through the session see it.
    /// Once the commit went through the call reports success, even if the
    /// session is poisoned or closed while delivering it.
    ///
    /// # Errors
    ///
    /// [`SessionError::Unsatisfied`] naming the offending match if a context
    /// match is invalid or would be invalidated by the transaction; nothing is
    /// committed. [`SessionError::Poisoned`] if the session is poisoned before
    /// the commit.
    pub async fn transact<F>(&self, mut build: F) -> Result<Committed, SessionError>
    where
        F: FnMut(&mut TxBuilder) + Send,
    {
        let session = self.session();
        let database = session.database();
        let warn_every = session.config().spin_warn_after.max(1);
        let mut spins = 0_u32;
        loop {
            let prepared = database.prepare(&mut build);
            let base = prepared.base();
            let visible = session.timestamp()?;
            let verdict = validate_all(self.context().iter(), base, &**prepared.candidate(), visible);
            match verdict {
                ValidationResult::Valid => match database.commit(prepared) {
                    Ok(change) => {
                        // Published: the outcome is success from here on.
                        if !change.novelty.is_empty() {
                            if let Err(err) = session.wait_until(change.after_timestamp()).await {
                                warn!(
                                    %err,
                                    timestamp = %change.after_timestamp(),
                                    "transaction committed but the session stopped before delivering it"
                                );
                            }
                        }
                        debug!(
                            timestamp = %change.after_timestamp(),
                            spins,
                            context = self.context().len(),
                            "transaction committed"
                        );
                        return Ok(Committed { change, spins });
                    }
                    Err(conflict) => debug!(%conflict, "retrying transaction"),
                },
                ValidationResult::Invalid(offending) => {
                    let reason = offending
                        .invalidation()
                        .unwrap_or_else(|| InvalidationReason::Retracted {
                            match_id: offending.id(),
                            at: prepared.candidate().timestamp(),
                        });
                    debug!(%reason, "transaction rejected");
                    return Err(UnsatisfiedMatch::new(reason).into());
                }
                ValidationResult::Inconclusive => {
                    spins = spins.saturating_add(1);
                    if spins % warn_every == 0 {
                        warn!(
                            spins,
                            %base,
                            %visible,
                            tag = self.tag().unwrap_or_default(),
                            "transaction still waiting for the network to catch up"
                        );
                    }
                    session.wait_until(base).await?;
                }
            }
        }
    }
}
