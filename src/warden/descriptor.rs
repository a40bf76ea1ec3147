//! Supervised process descriptors
//!
//! Lifecycle of each roster entry, driven by the state-machines crate in
//! dynamic mode.

use crate::manifest::LaunchSpec;
use state_machines::state_machine;

state_machine! {
    name: ProcessMachine,
    dynamic: true,
    initial: NotStarted,
    states: [NotStarted, Running, Dead],
    events {
        launched {
            transition: { from: [NotStarted, Dead], to: Running }
        }
        died {
            transition: { from: Running, to: Dead }
        }
    }
}

/// Simple state enum for display and comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Dead,
}

impl ProcessState {
    fn from_name(s: &str) -> Self {
        match s {
            "Running" => ProcessState::Running,
            "Dead" => ProcessState::Dead,
            _ => ProcessState::NotStarted,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not started"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Dead => write!(f, "dead"),
        }
    }
}

/// One named process the supervisor keeps alive
pub struct ProcessDescriptor {
    pub name: String,
    /// Command the current process was launched with
    pub command: Vec<String>,
    pub enabled: bool,
    /// PID of the last launch
    pub pid: Option<u32>,
    /// Command from a reload, applied at the next launch
    pub pending_command: Option<Vec<String>>,
    machine: DynamicProcessMachine<()>,
}

impl ProcessDescriptor {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            name: spec.name,
            command: spec.argv,
            enabled: spec.enabled,
            pid: None,
            pending_command: None,
            machine: ProcessMachine::new(()).into_dynamic(),
        }
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_name(self.machine.current_state())
    }

    /// Record a fresh launch
    pub fn launched(&mut self, pid: u32) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ProcessMachineEvent::Launched)?;
        self.pid = Some(pid);
        Ok(())
    }

    /// Record that the process is gone or no longer ours
    pub fn died(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ProcessMachineEvent::Died)
    }

    /// Adopt a command from a reloaded configuration.
    ///
    /// A live process keeps being matched against the command it was started
    /// with; the new one takes effect when it is next launched.
    pub fn adopt(&mut self, spec: LaunchSpec) -> bool {
        self.enabled = spec.enabled;
        if spec.argv == self.command {
            self.pending_command = None;
            return false;
        }
        if self.state() == ProcessState::Running {
            self.pending_command = Some(spec.argv);
        } else {
            self.command = spec.argv;
        }
        true
    }

    /// Command to use for the next launch
    pub fn take_launch_command(&mut self) -> &[String] {
        if let Some(command) = self.pending_command.take() {
            self.command = command;
        }
        &self.command
    }
}
