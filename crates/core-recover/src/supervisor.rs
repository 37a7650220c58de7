//! Alarm recovery sequences.
//!
//! One supervisor per controller, one episode at a time. Each alarm code maps
//! to a workflow: hard limits are never auto-recovered, soft limits unlock
//! and retreat to a safe point (safe height first), abort cycles unlock and
//! re-establish modal state, homing failures unlock and re-home under the
//! homing timeout. Every step goes through the executor at immediate
//! priority and is recorded in the episode's outcome.

use crate::classify::{ErrorKind, Severity, classify_alarm_code};
use core_command::{CommandExecutor, CommandPriority, SubmitOptions};
use core_config::RecoveryConfig;
use core_events::{EngineEvent, EventBus, EventChannel};
use core_mirror::{MachineMirror, MirrorSnapshot};
use core_protocol::commands::{HOME, UNLOCK};
use core_protocol::realtime::STATUS_QUERY;
use core_protocol::status::MachineState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Assumed travel envelope when the machine's limits are not queried; the
/// safe retreat point is its center.
const ASSUMED_TRAVEL_MM: f64 = 100.0;
/// Settling delay between unlock and re-home.
const PRE_HOME_DELAY: Duration = Duration::from_millis(500);
/// Wait bound for one post-command status verification.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Static per-alarm recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmSpec {
    pub name: &'static str,
    pub severity: Severity,
    pub auto_recoverable: bool,
}

/// Policy table for the standard alarm codes.
pub fn alarm_table(code: u8) -> AlarmSpec {
    match code {
        1 => AlarmSpec {
            name: "hard_limit",
            severity: Severity::Critical,
            auto_recoverable: false,
        },
        2 => AlarmSpec {
            name: "soft_limit",
            severity: Severity::High,
            auto_recoverable: true,
        },
        3 => AlarmSpec {
            name: "abort_cycle",
            severity: Severity::Medium,
            auto_recoverable: true,
        },
        4 | 5 => AlarmSpec {
            name: "probe_error",
            severity: Severity::Medium,
            auto_recoverable: true,
        },
        6..=9 => AlarmSpec {
            name: "homing_failure",
            severity: Severity::High,
            auto_recoverable: true,
        },
        _ => AlarmSpec {
            name: "unknown_alarm",
            severity: Severity::High,
            auto_recoverable: false,
        },
    }
}

/// Record of one recovery episode.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub alarm_code: u8,
    pub attempts: u32,
    pub duration: Duration,
    pub success: bool,
    pub reason: Option<String>,
    pub actions: Vec<String>,
}

pub struct AlarmSupervisor {
    executor: CommandExecutor,
    mirror: MachineMirror,
    bus: EventBus,
    config: RecoveryConfig,
    /// Serializes episodes; overlapping alarms queue or drop per config.
    episode: Mutex<()>,
}

impl AlarmSupervisor {
    pub fn new(
        executor: CommandExecutor,
        mirror: MachineMirror,
        bus: EventBus,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            executor,
            mirror,
            bus,
            config,
            episode: Mutex::new(()),
        }
    }

    /// Run the recovery workflow for `code`.
    pub async fn recover(&self, code: u8) -> RecoveryOutcome {
        let _guard = if self.config.queue_overlapping_alarms {
            self.episode.lock().await
        } else {
            match self.episode.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(target: "recover.supervisor", code, "alarm_dropped_episode_active");
                    return RecoveryOutcome {
                        alarm_code: code,
                        attempts: 0,
                        duration: Duration::ZERO,
                        success: false,
                        reason: Some("dropped: another recovery episode active".to_string()),
                        actions: Vec::new(),
                    };
                }
            }
        };

        let started = Instant::now();
        let spec = alarm_table(code);
        info!(
            target: "recover.supervisor",
            code,
            alarm = spec.name,
            "recovery_started"
        );
        self.bus.emit(EngineEvent::RecoveryStarted { alarm_code: code });

        if !spec.auto_recoverable || !self.config.enable_auto_recovery {
            let classification = classify_alarm_code(code);
            let reason = if spec.auto_recoverable {
                "auto recovery disabled by configuration".to_string()
            } else {
                format!("{} requires manual intervention", spec.name)
            };
            warn!(target: "recover.supervisor", code, reason = %reason, "recovery_manual");
            self.bus.emit(EngineEvent::RecoveryFailed {
                alarm_code: code,
                reason: reason.clone(),
            });
            return RecoveryOutcome {
                alarm_code: code,
                attempts: 0,
                duration: started.elapsed(),
                success: false,
                reason: Some(reason),
                actions: classification
                    .suggested_actions
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            };
        }

        // Modal and accessory state as believed before the unlock sequence
        // disturbs it; restorations replay from here.
        let before = self.mirror.snapshot();
        let mut attempts = 0;
        let mut last_reason = String::new();
        let mut actions = Vec::new();

        let episode = async {
            while attempts < self.config.max_recovery_attempts {
                attempts += 1;
                actions.clear();
                match self.attempt(code, &before, &mut actions).await {
                    Ok(()) => return true,
                    Err(reason) => {
                        warn!(
                            target: "recover.supervisor",
                            code,
                            attempt = attempts,
                            reason = %reason,
                            "recovery_attempt_failed"
                        );
                        last_reason = reason;
                    }
                }
            }
            false
        };

        let success = match timeout(self.config.recovery_timeout(), episode).await {
            Ok(success) => success,
            Err(_) => {
                last_reason = format!(
                    "recovery timeout after {} ms",
                    self.config.recovery_timeout_ms
                );
                false
            }
        };

        let duration = started.elapsed();
        if success {
            info!(target: "recover.supervisor", code, attempts, "recovery_completed");
            self.bus.emit(EngineEvent::RecoveryCompleted {
                alarm_code: code,
                attempts,
            });
            RecoveryOutcome {
                alarm_code: code,
                attempts,
                duration,
                success: true,
                reason: None,
                actions,
            }
        } else {
            warn!(target: "recover.supervisor", code, attempts, reason = %last_reason, "recovery_failed");
            self.bus.emit(EngineEvent::RecoveryFailed {
                alarm_code: code,
                reason: last_reason.clone(),
            });
            RecoveryOutcome {
                alarm_code: code,
                attempts,
                duration,
                success: false,
                reason: Some(last_reason),
                actions,
            }
        }
    }

    async fn attempt(
        &self,
        code: u8,
        before: &MirrorSnapshot,
        actions: &mut Vec<String>,
    ) -> Result<(), String> {
        match classify_alarm_code(code).kind {
            ErrorKind::SoftLimit => self.soft_limit_sequence(actions).await,
            ErrorKind::AbortCycle => self.abort_sequence(before, actions).await,
            ErrorKind::ProbeError => self.step(UNLOCK, None, actions).await,
            ErrorKind::HomingError => self.homing_sequence(actions).await,
            other => Err(format!("no workflow for {}", other.as_str())),
        }
    }

    /// Unlock, learn where the machine is, then retreat: safe height first,
    /// then an in-bounds XY point, then back down.
    async fn soft_limit_sequence(&self, actions: &mut Vec<String>) -> Result<(), String> {
        self.step(UNLOCK, None, actions).await?;
        let snapshot = self
            .polled_snapshot(actions)
            .await
            .ok_or_else(|| "no status frame after unlock".to_string())?;

        let (safe_x, safe_y) = safe_xy_point(snapshot.mpos.x, snapshot.mpos.y);
        self.step(&format!("G0Z{}", fmt_coord(self.config.safe_height_mm)), None, actions)
            .await?;
        self.step(
            &format!("G0X{}Y{}", fmt_coord(safe_x), fmt_coord(safe_y)),
            None,
            actions,
        )
        .await?;
        self.step("G0Z0", None, actions).await?;
        self.verify_idle(actions).await
    }

    /// Unlock, reset modal defaults, then the optional restorations.
    async fn abort_sequence(
        &self,
        before: &MirrorSnapshot,
        actions: &mut Vec<String>,
    ) -> Result<(), String> {
        self.step(UNLOCK, None, actions).await?;
        for modal in ["G90", "G21", "G17"] {
            self.step(modal, None, actions).await?;
        }
        if self.config.restore_work_offset {
            self.step(&before.modal.coord_system.gcode(), None, actions).await?;
        }
        if self.config.restore_modal {
            for command in before.modal.restore_commands() {
                self.step(&command, None, actions).await?;
            }
        }
        if self.config.restore_position && before.fresh {
            self.step(&format!("G0Z{}", fmt_coord(self.config.safe_height_mm)), None, actions)
                .await?;
            self.step(
                &format!("G0X{}Y{}", fmt_coord(before.mpos.x), fmt_coord(before.mpos.y)),
                None,
                actions,
            )
            .await?;
            self.step(&format!("G0Z{}", fmt_coord(before.mpos.z)), None, actions)
                .await?;
        }
        if self.config.restore_coolant && before.coolant_on {
            self.step("M8", None, actions).await?;
        }
        // Spindle restart stays off unless explicitly enabled.
        if self.config.restore_spindle && before.spindle_on {
            self.step(&format!("M3S{}", before.spindle_speed as u32), None, actions)
                .await?;
        }
        self.verify_idle(actions).await
    }

    /// Unlock, settle, re-home under the homing timeout, verify.
    async fn homing_sequence(&self, actions: &mut Vec<String>) -> Result<(), String> {
        self.step(UNLOCK, None, actions).await?;
        tokio::time::sleep(PRE_HOME_DELAY).await;
        self.step(HOME, Some(self.config.homing_timeout()), actions).await?;
        self.verify_idle(actions).await
    }

    /// Run one command at immediate priority and record it.
    async fn step(
        &self,
        payload: &str,
        step_timeout: Option<Duration>,
        actions: &mut Vec<String>,
    ) -> Result<(), String> {
        let mut options = SubmitOptions::priority(CommandPriority::Immediate);
        if let Some(step_timeout) = step_timeout {
            options = options.with_timeout(step_timeout);
        }
        debug!(target: "recover.supervisor", payload, "recovery_step");
        actions.push(payload.to_string());
        self.executor
            .run(payload, options)
            .await
            .map(|_| ())
            .map_err(|e| format!("{payload} failed: {e}"))
    }

    /// Out-of-band status query, answered through the mirror.
    async fn polled_snapshot(&self, actions: &mut Vec<String>) -> Option<MirrorSnapshot> {
        actions.push("?".to_string());
        let mut watch = self.mirror.watch();
        watch.borrow_and_update();
        self.executor.submit_immediate(STATUS_QUERY);
        timeout(VERIFY_TIMEOUT, watch.changed()).await.ok()?.ok()?;
        Some(watch.borrow().clone())
    }

    async fn verify_idle(&self, actions: &mut Vec<String>) -> Result<(), String> {
        let snapshot = self
            .polled_snapshot(actions)
            .await
            .ok_or_else(|| "no status frame for verification".to_string())?;
        match snapshot.state {
            MachineState::Idle | MachineState::Run | MachineState::Home => Ok(()),
            other => Err(format!("machine still in {other} after recovery")),
        }
    }
}

/// Center of the assumed travel envelope, the most conservative in-bounds
/// retreat without querying the machine's travel settings.
fn safe_xy_point(_current_x: f64, _current_y: f64) -> (f64, f64) {
    (ASSUMED_TRAVEL_MM / 2.0, ASSUMED_TRAVEL_MM / 2.0)
}

/// Format a coordinate the way hand-written g-code reads: no trailing zeros,
/// one decimal for non-integers.
fn fmt_coord(value: f64) -> String {
    if (value - value.round()).abs() < 1e-9 && value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let formatted = format!("{value:.3}");
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Background task: auto-recover on `alarm_detected` events when enabled.
/// Code 0 marks an alarm state noticed by polling with the code unknown;
/// recovery waits for the explicit `ALARM:N` line in that case.
pub fn spawn_alarm_listener(
    supervisor: Arc<AlarmSupervisor>,
    bus: EventBus,
) -> JoinHandle<()> {
    let mut alarms = bus.subscribe(EventChannel::AlarmDetected);
    tokio::spawn(async move {
        debug!(target: "recover.supervisor", "alarm_listener_started");
        loop {
            match alarms.recv().await {
                Ok(EngineEvent::AlarmDetected { code, .. }) => {
                    if code == 0 {
                        continue;
                    }
                    if !supervisor.config.enable_auto_recovery {
                        continue;
                    }
                    let outcome = supervisor.recover(code).await;
                    debug!(
                        target: "recover.supervisor",
                        code,
                        success = outcome.success,
                        attempts = outcome.attempts,
                        "auto_recovery_finished"
                    );
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(target: "recover.supervisor", "alarm_listener_stopped");
    })
}
