//! Prepare/stop handshake with the embedded motor controller.
//!
//! The controller is told to get ready through one digital output
//! (`prepare`) and answers on two digital inputs:
//!
//! | bit0 | bit1 | meaning |
//! |------|------|---------|
//! | 0 | 0 | not responding yet / idle |
//! | 1 | 0 | armed |
//! | 0 | 1 | controller fault (disk space, runtime license) |
//! | 1 | 1 | fieldbus fault (motor drive not answering) |
//!
//! Both fault kinds are retried after a remote reset, up to `max_retries`
//! times in total. Polling is always bounded; the controller lives in its own
//! fault domain and must never hang a session.
//!
//! ```text
//! Idle ──prepare()──▶ Preparing ──(1,0)──▶ Armed
//!                        │ fault, retries left: deassert, reset, again
//!                        └─ fault twice / timeout ──▶ Faulted
//! Armed ──stop()──▶ StoppingAcquisition ──(0,0)──▶ Idle
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::HandshakeConfig;
use crate::error::{AppResult, DaqError, HandshakePhase};
use crate::hardware::capabilities::{DigitalInput, DigitalOutput, RemoteController};

/// Protocol state of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Idle,
    Preparing,
    Armed,
    Faulted,
    StoppingAcquisition,
}

/// Decoded status line pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    NotResponding,
    Armed,
    Fault,
    BusFault,
}

impl ControllerStatus {
    pub fn from_bits(bit0: bool, bit1: bool) -> Self {
        match (bit0, bit1) {
            (false, false) => ControllerStatus::NotResponding,
            (true, false) => ControllerStatus::Armed,
            (false, true) => ControllerStatus::Fault,
            (true, true) => ControllerStatus::BusFault,
        }
    }

    pub fn bits(self) -> (bool, bool) {
        match self {
            ControllerStatus::NotResponding => (false, false),
            ControllerStatus::Armed => (true, false),
            ControllerStatus::Fault => (false, true),
            ControllerStatus::BusFault => (true, true),
        }
    }
}

/// Transient state of the current handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeSession {
    pub state: HandshakeState,
    /// Resets issued during the current prepare sequence.
    pub retries: u32,
    pub last_status: Option<ControllerStatus>,
}

/// Digital lines used by the handshake.
#[derive(Clone)]
pub struct HandshakeLines {
    pub prepare: Arc<dyn DigitalOutput>,
    pub status_bit0: Arc<dyn DigitalInput>,
    pub status_bit1: Arc<dyn DigitalInput>,
}

/// Drives the prepare/stop protocol.
pub struct HandshakeController {
    lines: HandshakeLines,
    remote: Arc<dyn RemoteController>,
    poll_interval: Duration,
    max_polls: u32,
    stop_max_polls: u32,
    max_retries: u32,
    session: HandshakeSession,
}

impl HandshakeController {
    pub fn new(lines: HandshakeLines, remote: Arc<dyn RemoteController>, config: &HandshakeConfig) -> Self {
        Self {
            lines,
            remote,
            poll_interval: config.poll_interval(),
            max_polls: config.max_polls,
            stop_max_polls: config.stop_max_polls,
            max_retries: config.max_retries,
            session: HandshakeSession::default(),
        }
    }

    pub fn session(&self) -> HandshakeSession {
        self.session
    }

    pub fn state(&self) -> HandshakeState {
        self.session.state
    }

    /// Ask the controller to arm, retrying faults after a remote reset.
    pub async fn prepare(&mut self) -> AppResult<()> {
        self.session = HandshakeSession {
            state: HandshakeState::Preparing,
            ..Default::default()
        };

        loop {
            let err = match self.attempt_prepare().await {
                Ok(()) => {
                    self.session.state = HandshakeState::Armed;
                    info!(retries = self.session.retries, "Controller armed");
                    return Ok(());
                }
                Err(e) => e,
            };

            let retryable = matches!(err, DaqError::HandshakeFault | DaqError::HandshakeBusFault);
            if retryable && self.session.retries < self.max_retries {
                self.session.retries += 1;
                warn!(
                    error = %err,
                    attempt = self.session.retries,
                    "Controller fault, resetting and retrying"
                );
                if let Err(line_err) = self.lines.prepare.write_line(false).await {
                    self.fail().await;
                    return Err(line_err.into());
                }
                if let Err(reset_err) = self.remote.reset().await {
                    self.fail().await;
                    return Err(reset_err);
                }
                continue;
            }

            warn!(error = %err, retries = self.session.retries, "Prepare handshake failed");
            self.fail().await;
            return Err(err);
        }
    }

    async fn attempt_prepare(&mut self) -> AppResult<()> {
        self.lines.prepare.write_line(true).await?;

        for poll in 1..=self.max_polls {
            let status = self.read_status().await?;
            debug!(poll, ?status, "Prepare poll");
            match status {
                ControllerStatus::Armed => return Ok(()),
                ControllerStatus::Fault => return Err(DaqError::HandshakeFault),
                ControllerStatus::BusFault => return Err(DaqError::HandshakeBusFault),
                ControllerStatus::NotResponding => tokio::time::sleep(self.poll_interval).await,
            }
        }
        Err(DaqError::HandshakeNotResponding {
            phase: HandshakePhase::Prepare,
        })
    }

    /// Deassert prepare and wait for the status lines to return to idle.
    ///
    /// Bounded by `stop_max_polls`; callers tear down regardless of the
    /// outcome.
    pub async fn stop(&mut self) -> AppResult<()> {
        self.session.state = HandshakeState::StoppingAcquisition;
        self.lines.prepare.write_line(false).await?;

        for poll in 1..=self.stop_max_polls {
            let status = self.read_status().await?;
            if status == ControllerStatus::NotResponding {
                debug!(poll, "Controller back to idle");
                self.session.state = HandshakeState::Idle;
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        self.session.state = HandshakeState::Faulted;
        Err(DaqError::HandshakeNotResponding {
            phase: HandshakePhase::Stop,
        })
    }

    async fn read_status(&mut self) -> AppResult<ControllerStatus> {
        let bit0 = self.lines.status_bit0.read_line().await?;
        let bit1 = self.lines.status_bit1.read_line().await?;
        let status = ControllerStatus::from_bits(bit0, bit1);
        self.session.last_status = Some(status);
        Ok(status)
    }

    async fn fail(&mut self) {
        self.session.state = HandshakeState::Faulted;
        if let Err(e) = self.lines.prepare.write_line(false).await {
            warn!(error = %e, "Could not deassert prepare line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{ControllerResponse, SimulatedController};

    fn controller(sim: &SimulatedController) -> HandshakeController {
        let (bit0, bit1) = sim.status_lines();
        let lines = HandshakeLines {
            prepare: Arc::new(sim.prepare_line()),
            status_bit0: Arc::new(bit0),
            status_bit1: Arc::new(bit1),
        };
        HandshakeController::new(lines, Arc::new(sim.clone()), &HandshakeConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn armed_without_retry() {
        let sim = SimulatedController::new().with_script([ControllerResponse::Arm { after_polls: 4 }]);
        let mut handshake = controller(&sim);

        handshake.prepare().await.unwrap();
        assert_eq!(handshake.state(), HandshakeState::Armed);
        assert_eq!(handshake.session().retries, 0);
        assert_eq!(handshake.session().last_status, Some(ControllerStatus::Armed));
        assert_eq!(sim.prepare_requests(), 1);
        assert_eq!(sim.resets(), 0);
        assert!(sim.is_prepared());
    }

    #[tokio::test(start_paused = true)]
    async fn fault_then_armed_after_reset() {
        let sim = SimulatedController::new().with_script([
            ControllerResponse::BusFault,
            ControllerResponse::Arm { after_polls: 1 },
        ]);
        let mut handshake = controller(&sim);

        handshake.prepare().await.unwrap();
        assert_eq!(handshake.session().retries, 1);
        assert_eq!(sim.resets(), 1);
        assert_eq!(sim.prepare_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fault_twice_is_terminal_without_third_attempt() {
        let sim = SimulatedController::new().with_script([
            ControllerResponse::Fault,
            ControllerResponse::Fault,
            ControllerResponse::Arm { after_polls: 1 },
        ]);
        let mut handshake = controller(&sim);

        let err = handshake.prepare().await.unwrap_err();
        assert!(matches!(err, DaqError::HandshakeFault));
        assert_eq!(handshake.state(), HandshakeState::Faulted);
        assert_eq!(sim.prepare_requests(), 2);
        assert_eq!(sim.resets(), 1);
        assert!(!sim.is_prepared());
    }

    #[tokio::test(start_paused = true)]
    async fn bus_fault_twice_is_terminal() {
        let sim = SimulatedController::new().with_default_response(ControllerResponse::BusFault);
        let mut handshake = controller(&sim);

        let err = handshake.prepare().await.unwrap_err();
        assert!(matches!(err, DaqError::HandshakeBusFault));
        assert_eq!(sim.prepare_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_without_retry() {
        let sim = SimulatedController::new().with_default_response(ControllerResponse::Silent);
        let mut handshake = controller(&sim);

        let started = tokio::time::Instant::now();
        let err = handshake.prepare().await.unwrap_err();
        assert!(matches!(
            err,
            DaqError::HandshakeNotResponding {
                phase: HandshakePhase::Prepare
            }
        ));
        assert_eq!(sim.prepare_requests(), 1);
        assert_eq!(sim.resets(), 0);
        // Ten polls, 100 ms apart.
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_to_idle() {
        let sim = SimulatedController::new();
        let mut handshake = controller(&sim);
        handshake.prepare().await.unwrap();

        handshake.stop().await.unwrap();
        assert_eq!(handshake.state(), HandshakeState::Idle);
        assert!(!sim.is_prepared());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_bounded_when_controller_stays_busy() {
        let sim = SimulatedController::new().stuck_on_stop();
        let mut handshake = controller(&sim);
        handshake.prepare().await.unwrap();

        let err = handshake.stop().await.unwrap_err();
        assert!(matches!(
            err,
            DaqError::HandshakeNotResponding {
                phase: HandshakePhase::Stop
            }
        ));
        assert_eq!(handshake.state(), HandshakeState::Faulted);
    }

    /// Prepare line that can be raised but never released.
    struct StuckHighLine(crate::hardware::mock::ControllerPrepareLine);

    #[async_trait::async_trait]
    impl DigitalOutput for StuckHighLine {
        async fn write_line(&self, value: bool) -> crate::hardware::capabilities::DriverResult<()> {
            if !value {
                return Err(crate::error::DriverError::new(
                    "stuck-line",
                    crate::error::DriverErrorKind::Hardware,
                    "line driver latched high",
                ));
            }
            self.0.write_line(value).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn release_failure_during_retry_faults_the_handshake() {
        let sim = SimulatedController::new().with_script([ControllerResponse::Fault]);
        let (bit0, bit1) = sim.status_lines();
        let lines = HandshakeLines {
            prepare: Arc::new(StuckHighLine(sim.prepare_line())),
            status_bit0: Arc::new(bit0),
            status_bit1: Arc::new(bit1),
        };
        let mut handshake = HandshakeController::new(lines, Arc::new(sim.clone()), &HandshakeConfig::default());

        let err = handshake.prepare().await.unwrap_err();
        assert!(matches!(err, DaqError::Driver(_)));
        assert_eq!(handshake.state(), HandshakeState::Faulted);
        assert_eq!(sim.resets(), 0);
    }

    #[test]
    fn status_bits_round_trip() {
        for status in [
            ControllerStatus::NotResponding,
            ControllerStatus::Armed,
            ControllerStatus::Fault,
            ControllerStatus::BusFault,
        ] {
            let (b0, b1) = status.bits();
            assert_eq!(ControllerStatus::from_bits(b0, b1), status);
        }
    }
}
