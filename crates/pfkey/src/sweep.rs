//! The lifetime sweep: periodic expiry of policies, larval SAs, and
//! keyed SAs, plus garbage collection of empty association heads and
//! stale negotiation records.
//!
//! Every pass is two-phase: candidates are collected under a read lock,
//! the state transitions happen under the write lock with re-validation,
//! and notifications are built and delivered with no store lock held.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::builder::MsgBuilder;
use crate::context::KeyStoreContext;
use crate::deliver::DeliveryTarget;
use crate::ext::{EXT_ADDRESS_DST, EXT_ADDRESS_SRC, EXT_LIFETIME_CURRENT, EXT_LIFETIME_HARD,
    EXT_LIFETIME_SOFT};
use crate::keys::Lifetime;
use crate::msg::MsgType;
use crate::sad::SecAssoc;
use crate::spd::SecPolicy;
use crate::types::{SaState, SaType, ULPROTO_ANY};

impl KeyStoreContext {
    /// Run one full sweep at time `now` (seconds).
    pub fn sweep(&self, now: u64) {
        self.sweep_spd(now);
        self.sweep_sad(now);
        self.acq.sweep(now, self.config.blockacq_lifetime);
        self.spacq.sweep(now, self.config.blockacq_lifetime);
    }

    /// Spawn the periodic sweeper; it stops once the context is gone.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                let now = ctx.now();
                ctx.sweep(now);
            }
        })
    }

    fn sweep_spd(&self, now: u64) {
        let expired: Vec<Arc<SecPolicy>> = self
            .spd
            .snapshot()
            .into_iter()
            .filter(|sp| {
                if sp.lifetime == 0 && sp.validtime == 0 {
                    return false;
                }
                (sp.lifetime != 0 && now.saturating_sub(sp.created) > sp.lifetime)
                    || (sp.validtime != 0 && now.saturating_sub(sp.last_used()) > sp.validtime)
            })
            .collect();
        for sp in expired {
            // unlink re-checks liveness, so a concurrent delete cannot
            // produce a second expiry notification
            if self.spd.unlink(&sp) {
                debug!(id = sp.id, "SP lifetime expired");
                let _ = self.notify_sp_expired(&sp);
            }
        }
    }

    fn sweep_sad(&self, now: u64) {
        let mut stale_larval = Vec::new();
        let mut hard_expired = Vec::new();
        let mut soft_expired = Vec::new();
        let mut empty_heads = Vec::new();

        for head in self.sad.heads_snapshot() {
            if head.is_empty() {
                empty_heads.push(head);
                continue;
            }
            for sa in head.larval_snapshot() {
                if now.saturating_sub(sa.created()) >= self.config.larval_lifetime {
                    stale_larval.push(sa);
                }
            }
            for sa in head.alive_snapshot() {
                let cur = sa.current_lifetime();
                let verdict = sa.with_crypt(|c| {
                    let Some(hard) = &c.lft_hard else {
                        return None;
                    };
                    // hard limits take precedence when both fire at once
                    if limit_hit(hard, &cur, now) {
                        return Some(true);
                    }
                    if sa.state() == SaState::Mature
                        && c.lft_soft.as_ref().is_some_and(|s| limit_hit(s, &cur, now))
                    {
                        return Some(false);
                    }
                    None
                });
                match verdict {
                    Some(true) => hard_expired.push(sa),
                    Some(false) => soft_expired.push(sa),
                    None => {}
                }
            }
        }

        // stale negotiations die silently
        for sa in stale_larval {
            if sa.state() == SaState::Larval && self.sad.unlink(&sa) {
                trace!(spi = sa.spi, "reaped stale larval SA");
            }
        }
        for sa in hard_expired {
            if self.sad.unlink(&sa) {
                debug!(spi = sa.spi, "hard lifetime expired");
                let _ = self.notify_sa_expired(&sa, true);
            }
        }
        for sa in soft_expired {
            if self.sad.demote(&sa) {
                debug!(spi = sa.spi, "soft lifetime expired");
                let _ = self.notify_sa_expired(&sa, false);
            }
        }
        for head in empty_heads {
            if self.sad.unlink_head_if_empty(&head) {
                trace!("reclaimed empty SAH");
            }
        }
    }

    /// Expire notification for an SA, pushed to the listeners registered
    /// for its protocol.
    fn notify_sa_expired(&self, sa: &Arc<SecAssoc>, hard: bool) -> crate::Result<()> {
        let head = sa.head();
        let satype = head.satype();
        let mut b = MsgBuilder::new(MsgType::Expire, satype.wire(), sa.seq, 0);
        b.set_reserved(Arc::strong_count(sa) as u16);
        sa.with_crypt(|c| {
            b.sa_ext(
                sa.spi,
                c.replay.as_ref().map(|r| r.wsize).unwrap_or(0),
                sa.state() as u8,
                c.auth_alg,
                c.enc_alg,
                c.flags,
            );
            b.sa2(
                head.saidx.mode.wire(),
                c.replay.as_ref().map(|r| r.count).unwrap_or(0),
                head.saidx.reqid,
            );
            b.lifetime(EXT_LIFETIME_CURRENT, &sa.current_lifetime());
            if hard {
                b.lifetime(EXT_LIFETIME_HARD, &c.lft_hard.unwrap_or_default());
            } else {
                b.lifetime(EXT_LIFETIME_SOFT, &c.lft_soft.unwrap_or_default());
            }
        });
        b.address(
            EXT_ADDRESS_SRC,
            &head.saidx.src,
            head.saidx.src.addr_bits(),
            ULPROTO_ANY,
        );
        b.address(
            EXT_ADDRESS_DST,
            &head.saidx.dst,
            head.saidx.dst.addr_bits(),
            ULPROTO_ANY,
        );
        self.sendup(None, DeliveryTarget::Registered(satype), b.finish())
    }

    /// Expire notification for a policy.
    fn notify_sp_expired(&self, sp: &Arc<SecPolicy>) -> crate::Result<()> {
        let mut b = MsgBuilder::new(MsgType::SpdExpire, SaType::Unspec.wire(), 0, 0);
        b.lifetime(
            EXT_LIFETIME_CURRENT,
            &Lifetime {
                allocations: 0,
                bytes: 0,
                addtime: sp.created,
                usetime: sp.last_used(),
            },
        );
        b.lifetime(
            EXT_LIFETIME_HARD,
            &Lifetime {
                allocations: 0,
                bytes: 0,
                addtime: sp.lifetime,
                usetime: sp.validtime,
            },
        );
        b.address(
            EXT_ADDRESS_SRC,
            &sp.spidx.src,
            sp.spidx.prefs,
            sp.spidx.ul_proto,
        );
        b.address(
            EXT_ADDRESS_DST,
            &sp.spidx.dst,
            sp.spidx.prefd,
            sp.spidx.ul_proto,
        );
        sp.write_policy_ext(&mut b);
        self.sendup(
            None,
            DeliveryTarget::Registered(SaType::Unspec),
            b.finish(),
        )
    }
}

/// One lifetime limit record against the current counters.
fn limit_hit(limit: &Lifetime, cur: &Lifetime, now: u64) -> bool {
    (limit.addtime != 0 && now.saturating_sub(cur.addtime) > limit.addtime)
        || (limit.usetime != 0
            && cur.usetime != 0
            && now.saturating_sub(cur.usetime) > limit.usetime)
        || (limit.bytes != 0 && cur.bytes > limit.bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_hit_rules() {
        let cur = Lifetime {
            allocations: 0,
            bytes: 500,
            addtime: 100,
            usetime: 0,
        };
        // hard addtime of 100s, created at t=100
        let lim = Lifetime {
            allocations: 0,
            bytes: 0,
            addtime: 100,
            usetime: 0,
        };
        assert!(!limit_hit(&lim, &cur, 150));
        assert!(limit_hit(&lim, &cur, 201));
        // byte limit
        let lim = Lifetime {
            bytes: 400,
            ..Default::default()
        };
        assert!(limit_hit(&lim, &cur, 0));
        // use-time limit never fires before first use
        let lim = Lifetime {
            usetime: 10,
            ..Default::default()
        };
        assert!(!limit_hit(&lim, &cur, 1000));
        let used = Lifetime { usetime: 100, ..cur };
        assert!(limit_hit(&lim, &used, 111));
    }
}
