//! Mirror-versus-controller reconciliation.
//!
//! The synchronizer compares a freshly polled status frame against the
//! mirror's snapshot, category by category, with a float tolerance for
//! positions. Resolution follows the configured policy: adopt controller
//! truth, push the mirror's view back to the controller, or surface a
//! conflict event and touch nothing.

use crate::{MachineMirror, MirrorSnapshot};
use core_command::{CommandExecutor, CommandPriority, SubmitOptions};
use core_config::{SyncConfig, SyncPolicy};
use core_events::{EngineEvent, EventBus, SyncCategory};
use core_protocol::commands::{PARSER_STATE, VIEW_OFFSETS};
use core_protocol::status::StatusFrame;
use tracing::{debug, info, warn};

/// One detected divergence between mirror and controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub category: SyncCategory,
    pub critical: bool,
    pub detail: String,
}

/// Compare `snapshot` against `frame`. Float fields use `tolerance_mm`.
pub fn compare(
    snapshot: &MirrorSnapshot,
    frame: &StatusFrame,
    tolerance_mm: f64,
) -> Vec<Discrepancy> {
    let mut discrepancies = Vec::new();

    if snapshot.state != frame.state {
        discrepancies.push(Discrepancy {
            category: SyncCategory::Status,
            critical: true,
            detail: format!("mirror {} vs controller {}", snapshot.state, frame.state),
        });
    }

    if let Some(mpos) = frame.mpos {
        let distance = snapshot.mpos.distance_to(&mpos);
        if distance > tolerance_mm {
            discrepancies.push(Discrepancy {
                category: SyncCategory::MachinePosition,
                critical: true,
                detail: format!("machine position off by {distance:.3} mm"),
            });
        }
    }

    if let Some(wpos) = frame.work_position() {
        let distance = snapshot.work_position().distance_to(&wpos);
        if distance > tolerance_mm {
            discrepancies.push(Discrepancy {
                category: SyncCategory::WorkPosition,
                critical: false,
                detail: format!("work position off by {distance:.3} mm"),
            });
        }
    }

    if let Some(feed) = frame.feed
        && (snapshot.feed - feed).abs() > tolerance_mm
    {
        discrepancies.push(Discrepancy {
            category: SyncCategory::Motion,
            critical: false,
            detail: format!("feed mirror {} vs controller {}", snapshot.feed, feed),
        });
    }

    if let (Some(mirror_buffer), Some(frame_buffer)) = (snapshot.buffer, frame.buffer)
        && mirror_buffer != frame_buffer
    {
        discrepancies.push(Discrepancy {
            category: SyncCategory::Buffer,
            critical: false,
            detail: format!(
                "buffer mirror {}/{} vs controller {}/{}",
                mirror_buffer.planner_free,
                mirror_buffer.rx_free,
                frame_buffer.planner_free,
                frame_buffer.rx_free
            ),
        });
    }

    discrepancies
}

/// Policy-driven reconciliation against the live executor and mirror.
pub struct Synchronizer {
    mirror: MachineMirror,
    executor: CommandExecutor,
    bus: EventBus,
    config: SyncConfig,
}

impl Synchronizer {
    pub fn new(
        mirror: MachineMirror,
        executor: CommandExecutor,
        bus: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            mirror,
            executor,
            bus,
            config,
        }
    }

    /// Compare and resolve. Returns the discrepancies found, already acted on
    /// per the configured policy.
    pub async fn reconcile(&self, frame: &StatusFrame) -> Vec<Discrepancy> {
        let snapshot = self.mirror.snapshot();
        let discrepancies = compare(&snapshot, frame, self.config.position_tolerance_mm);
        if discrepancies.is_empty() {
            return discrepancies;
        }

        let critical = discrepancies.iter().filter(|d| d.critical).count();
        info!(
            target: "mirror.sync",
            total = discrepancies.len(),
            critical,
            policy = ?self.config.policy,
            "discrepancies_found"
        );

        match self.config.policy {
            SyncPolicy::HardwarePriority => {
                self.mirror.overwrite_from_frame(frame.clone()).await;
                if critical > 0 {
                    // Position or state drifted; re-verify modal truth too.
                    self.request_verification().await;
                }
            }
            SyncPolicy::SoftwarePriority => {
                self.push_mirror_state(&snapshot).await;
            }
            SyncPolicy::Manual => {
                for discrepancy in &discrepancies {
                    warn!(
                        target: "mirror.sync",
                        category = ?discrepancy.category,
                        detail = %discrepancy.detail,
                        "sync_conflict_manual"
                    );
                    self.bus.emit(EngineEvent::SyncConflict {
                        category: discrepancy.category,
                        detail: discrepancy.detail.clone(),
                    });
                }
            }
        }
        discrepancies
    }

    /// Targeted queries whose answers refresh the mirror: parser state and
    /// coordinate offsets.
    pub async fn request_verification(&self) {
        for query in [PARSER_STATE, VIEW_OFFSETS] {
            let submitted = self
                .executor
                .submit(query, SubmitOptions::priority(CommandPriority::Low))
                .await;
            // Low priority may be rejected under load; verification is
            // opportunistic and will be retried on the next divergence.
            if let Err(e) = submitted.outcome().await {
                debug!(target: "mirror.sync", query, error = %e, "verification_query_failed");
            }
        }
    }

    /// Software-priority correction: replay the mirror's modal state onto the
    /// controller.
    async fn push_mirror_state(&self, snapshot: &MirrorSnapshot) {
        for command in snapshot.modal.restore_commands() {
            let result = self
                .executor
                .run(&command, SubmitOptions::priority(CommandPriority::High))
                .await;
            if let Err(e) = result {
                warn!(target: "mirror.sync", command = %command, error = %e, "corrective_command_failed");
                return;
            }
        }
    }
}
