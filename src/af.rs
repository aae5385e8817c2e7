//! Autofocus state machine.
//!
//! Application triggers, cancels and per-frame hardware notifications are
//! dispatched by the configured AF mode to one of three transition tables:
//! auto/macro, continuous-video and continuous-picture. The context is owned
//! by the sensor thread; every method takes `&mut self` and nothing in here
//! locks.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::traits::PipelineListener;

/// Configured autofocus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AfMode {
    /// Autofocus disabled.
    Off,
    /// Single-shot autofocus on trigger.
    #[default]
    Auto,
    /// Single-shot autofocus, close range.
    Macro,
    /// Continuous autofocus tuned for video (locks immediately on trigger).
    ContinuousVideo,
    /// Continuous autofocus tuned for stills (finishes the scan before locking).
    ContinuousPicture,
}

impl AfMode {
    const fn is_continuous(self) -> bool {
        matches!(self, Self::ContinuousVideo | Self::ContinuousPicture)
    }
}

/// Internal autofocus state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfState {
    /// Idle.
    #[default]
    Inactive,
    /// A trigger must be sent with the next frame.
    NeedsCommand,
    /// Hardware has been commanded, no scan reported yet.
    Started,
    /// Hardware is scanning.
    Scanning,
    /// Focus locked.
    Locked,
    /// Focus failed and locked.
    Failed,
    /// Trigger arrived mid-scan; waiting for the scan outcome.
    NeedsDetermination,
    /// Continuous scan settled in focus.
    PassiveFocused,
}

/// Autofocus state reported by hardware for each completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfHwState {
    /// Autofocus idle.
    #[default]
    Inactive,
    /// Lens is sweeping.
    ActiveScan,
    /// Scan finished in focus.
    AcquiredFocus,
    /// Scan finished out of focus.
    FailedFocus,
}

/// Autofocus state as exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfServiceState {
    /// Idle.
    #[default]
    Inactive,
    /// Continuous scan in progress.
    PassiveScan,
    /// Continuous scan settled in focus.
    PassiveFocused,
    /// Triggered scan in progress.
    ActiveScan,
    /// Locked in focus.
    FocusedLocked,
    /// Locked out of focus.
    NotFocusedLocked,
}

/// Autofocus trigger command carried by a shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfTrigger {
    /// No command.
    #[default]
    Idle,
    /// Start a scan; the id correlates the eventual lock back to the caller.
    Start(i32),
    /// Abort the current scan.
    Cancel(i32),
}

/// Autofocus fields to write into the next outgoing shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AfCommand {
    /// Hardware AF mode to program, if it must change.
    pub mode: Option<AfMode>,
    /// Trigger command.
    pub trigger: AfTrigger,
}

/// Events fed to the per-mode tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfEvent {
    Trigger,
    Notify(AfHwState),
}

/// Outcome of a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Stay,
    Go(AfState),
    Announce(AfState, AfServiceState),
    Undefined,
}

/// Hardware mode reset used by continuous-mode cancel: off, then back on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeCycle {
    None,
    SendOff,
    Restore,
}

/// Autofocus context: state, mode, pending trigger and mode-update bookkeeping.
#[derive(Debug)]
pub struct AfContext {
    state: AfState,
    mode: AfMode,
    trigger_id: i32,
    trigger_required: bool,
    cancel_required: bool,
    mode_update_required: bool,
    mode_cycle: ModeCycle,
    update_in_flight: bool,
    update_frame: u32,
    pending_mode: Option<AfMode>,
    service_state: AfServiceState,
}

impl AfContext {
    /// New context in `mode`. The first command programs the mode into hardware.
    pub const fn new(mode: AfMode) -> Self {
        Self {
            state: AfState::Inactive,
            mode,
            trigger_id: 0,
            trigger_required: false,
            cancel_required: false,
            mode_update_required: true,
            mode_cycle: ModeCycle::None,
            update_in_flight: false,
            update_frame: 0,
            pending_mode: None,
            service_state: AfServiceState::Inactive,
        }
    }

    /// Current internal state.
    pub const fn state(&self) -> AfState {
        self.state
    }

    /// Currently applied mode.
    pub const fn mode(&self) -> AfMode {
        self.mode
    }

    /// Id of the most recent trigger or cancel.
    pub const fn trigger_id(&self) -> i32 {
        self.trigger_id
    }

    /// Whether a trigger is waiting to be written into a shot.
    pub const fn is_trigger_pending(&self) -> bool {
        self.trigger_required
    }

    /// Mode change queued behind an in-flight update.
    pub const fn pending_mode(&self) -> Option<AfMode> {
        self.pending_mode
    }

    /// Last service-visible state announced to the listener.
    pub const fn service_state(&self) -> AfServiceState {
        self.service_state
    }

    /// Change the AF mode. Queued one-deep while a hardware update is in flight.
    ///
    /// Asking for the mode already in effect leaves state and any pending
    /// trigger alone; while an update is in flight it drops a queued change.
    pub fn set_mode(&mut self, mode: AfMode, listener: &dyn PipelineListener) {
        if self.update_in_flight {
            let queued = (mode != self.mode).then_some(mode);
            if self.pending_mode != queued {
                debug!(replaced = ?self.pending_mode, ?queued, "af mode change queued");
                self.pending_mode = queued;
            }
            return;
        }
        self.pending_mode = None;
        if mode != self.mode {
            self.apply_mode(mode, listener);
        }
    }

    fn apply_mode(&mut self, mode: AfMode, listener: &dyn PipelineListener) {
        debug!(from = ?self.mode, to = ?mode, "af mode applied");
        self.mode = mode;
        self.state = AfState::Inactive;
        self.trigger_required = false;
        self.cancel_required = false;
        self.mode_cycle = ModeCycle::None;
        self.mode_update_required = true;
        self.announce(AfServiceState::Inactive, listener);
    }

    /// Application trigger.
    pub fn on_trigger(&mut self, id: i32, listener: &dyn PipelineListener) {
        self.trigger_id = id;
        if self.mode == AfMode::Off {
            debug!(id, "af trigger ignored, mode off");
            return;
        }
        let step = self.lookup(AfEvent::Trigger);
        if self.apply(step, AfEvent::Trigger, listener) == Some(AfState::NeedsCommand) {
            self.trigger_required = true;
            self.cancel_required = false;
        }
    }

    /// Application cancel. Any non-inactive state returns to `Inactive`.
    pub fn on_cancel(&mut self, id: i32, listener: &dyn PipelineListener) {
        self.trigger_id = id;
        let previous = self.state;
        if previous != AfState::Inactive {
            self.state = AfState::Inactive;
            self.trigger_required = false;
            if self.mode.is_continuous() {
                self.mode_cycle = ModeCycle::SendOff;
            } else if previous != AfState::NeedsCommand {
                self.cancel_required = true;
            }
            debug!(id, ?previous, mode = ?self.mode, "af cancelled");
        }
        self.announce(AfServiceState::Inactive, listener);
    }

    /// Hardware notification for the completed frame `frame_count`.
    ///
    /// An in-flight mode update settles only once the frame that carried it
    /// (or a later one) reports back.
    pub fn on_notification(
        &mut self,
        frame_count: u32,
        hw: AfHwState,
        listener: &dyn PipelineListener,
    ) {
        if self.update_in_flight && reached(frame_count, self.update_frame) {
            self.update_in_flight = false;
            if let Some(mode) = self.pending_mode.take() {
                self.apply_mode(mode, listener);
                return;
            }
        }
        if self.mode == AfMode::Off {
            return;
        }
        let event = AfEvent::Notify(hw);
        let step = self.lookup(event);
        self.apply(step, event, listener);
    }

    /// Produce the AF fields for the shot of `frame_count` and advance command state.
    pub fn take_command(&mut self, frame_count: u32) -> AfCommand {
        let mut command = AfCommand::default();

        match self.mode_cycle {
            ModeCycle::SendOff => {
                command.mode = Some(AfMode::Off);
                self.mode_cycle = ModeCycle::Restore;
                self.update_in_flight = true;
            }
            ModeCycle::Restore => {
                command.mode = Some(self.mode);
                self.mode_cycle = ModeCycle::None;
                self.update_in_flight = true;
                self.start_continuous();
            }
            ModeCycle::None if self.mode_update_required => {
                command.mode = Some(self.mode);
                self.mode_update_required = false;
                self.update_in_flight = true;
                self.start_continuous();
            }
            ModeCycle::None => {}
        }
        if command.mode.is_some() {
            self.update_frame = frame_count;
        }

        if self.cancel_required {
            command.trigger = AfTrigger::Cancel(self.trigger_id);
            self.cancel_required = false;
        } else if self.trigger_required && self.state == AfState::NeedsCommand {
            command.trigger = AfTrigger::Start(self.trigger_id);
            self.trigger_required = false;
            self.state = AfState::Started;
        }
        command
    }

    fn start_continuous(&mut self) {
        if self.mode.is_continuous() && self.state == AfState::Inactive {
            self.state = AfState::Started;
        }
    }

    fn lookup(&self, event: AfEvent) -> Step {
        match self.mode {
            AfMode::Off => Step::Stay,
            AfMode::Auto | AfMode::Macro => auto_macro_step(self.state, event),
            AfMode::ContinuousVideo => continuous_step(self.state, event, true),
            AfMode::ContinuousPicture => continuous_step(self.state, event, false),
        }
    }

    fn apply(
        &mut self,
        step: Step,
        event: AfEvent,
        listener: &dyn PipelineListener,
    ) -> Option<AfState> {
        match step {
            Step::Stay => None,
            Step::Go(next) => {
                self.state = next;
                Some(next)
            }
            Step::Announce(next, service) => {
                self.state = next;
                self.announce(service, listener);
                Some(next)
            }
            Step::Undefined => {
                warn!(state = ?self.state, ?event, mode = ?self.mode, "undefined af transition");
                None
            }
        }
    }

    fn announce(&mut self, service: AfServiceState, listener: &dyn PipelineListener) {
        if service == self.service_state {
            return;
        }
        self.service_state = service;
        listener.on_af_state(service, self.trigger_id);
    }
}

/// Whether `frame_count` is `target` or later, tolerating wrap-around.
const fn reached(frame_count: u32, target: u32) -> bool {
    frame_count.wrapping_sub(target) < 1 << 31
}

fn auto_macro_step(state: AfState, event: AfEvent) -> Step {
    use AfHwState as Hw;
    use AfState as S;

    match (state, event) {
        (S::Inactive | S::Locked | S::Failed, AfEvent::Trigger) => Step::Go(S::NeedsCommand),
        (S::NeedsCommand | S::Started | S::Scanning, AfEvent::Trigger)
        | (S::Inactive | S::NeedsCommand, AfEvent::Notify(_))
        | (S::Started, AfEvent::Notify(Hw::Inactive | Hw::AcquiredFocus | Hw::FailedFocus))
        | (S::Scanning, AfEvent::Notify(Hw::ActiveScan))
        | (S::Locked, AfEvent::Notify(Hw::AcquiredFocus))
        | (S::Failed, AfEvent::Notify(Hw::FailedFocus)) => Step::Stay,
        (S::Started, AfEvent::Notify(Hw::ActiveScan)) => {
            Step::Announce(S::Scanning, AfServiceState::ActiveScan)
        }
        (S::Scanning, AfEvent::Notify(Hw::AcquiredFocus)) => {
            Step::Announce(S::Locked, AfServiceState::FocusedLocked)
        }
        (S::Scanning, AfEvent::Notify(Hw::FailedFocus)) => {
            Step::Announce(S::Failed, AfServiceState::NotFocusedLocked)
        }
        _ => Step::Undefined,
    }
}

fn continuous_step(state: AfState, event: AfEvent, video: bool) -> Step {
    use AfHwState as Hw;
    use AfState as S;

    match (state, event) {
        (S::Inactive, AfEvent::Trigger) => {
            Step::Announce(S::Failed, AfServiceState::NotFocusedLocked)
        }
        (S::Started | S::Scanning, AfEvent::Trigger) if video => {
            Step::Announce(S::Failed, AfServiceState::NotFocusedLocked)
        }
        (S::Started | S::Scanning, AfEvent::Trigger) => Step::Go(S::NeedsDetermination),
        (S::PassiveFocused, AfEvent::Trigger) => {
            Step::Announce(S::Locked, AfServiceState::FocusedLocked)
        }
        (S::Locked | S::Failed | S::NeedsDetermination, AfEvent::Trigger)
        | (S::Inactive | S::Locked | S::Failed, AfEvent::Notify(_))
        | (S::Started, AfEvent::Notify(Hw::Inactive | Hw::FailedFocus))
        | (S::Scanning, AfEvent::Notify(Hw::ActiveScan | Hw::FailedFocus))
        | (S::PassiveFocused, AfEvent::Notify(Hw::AcquiredFocus))
        | (S::NeedsDetermination, AfEvent::Notify(Hw::ActiveScan)) => Step::Stay,
        (S::Started | S::PassiveFocused, AfEvent::Notify(Hw::ActiveScan)) => {
            Step::Announce(S::Scanning, AfServiceState::PassiveScan)
        }
        (S::Started | S::Scanning, AfEvent::Notify(Hw::AcquiredFocus)) => {
            Step::Announce(S::PassiveFocused, AfServiceState::PassiveFocused)
        }
        (S::NeedsDetermination, AfEvent::Notify(Hw::AcquiredFocus)) => {
            Step::Announce(S::Locked, AfServiceState::FocusedLocked)
        }
        (S::NeedsDetermination, AfEvent::Notify(Hw::FailedFocus)) => {
            Step::Announce(S::Failed, AfServiceState::NotFocusedLocked)
        }
        _ => Step::Undefined,
    }
}
