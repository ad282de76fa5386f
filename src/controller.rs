//! Debugger control surface for a running VM.
//!
//! A [`VmController`] owns nothing but channel ends. The [`VM`] itself lives
//! on a dedicated worker task that drains commands between bounded slices of
//! execution, so `pause` and `stop` take effect at the next cycle boundary
//! and the VM is never shared across threads.

use crate::virtual_machine::config::VMConfig;
use crate::virtual_machine::errors::{Fault, VMError};
use crate::virtual_machine::program::Program;
use crate::virtual_machine::vm::{MachineState, RunOutcome, VM};
use crate::{error, info, warn};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// Cycles executed between two polls of the command channel.
pub const DEFAULT_SLICE: u64 = 4096;

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Reply to a control command.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlResponse {
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// Cause of the failure when `success` is false.
    pub error: Option<VMError>,
}

impl ControlResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    fn failed(error: VMError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error: Some(error),
        }
    }
}

/// State change published to every subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlEvent {
    Loaded { words: usize },
    Started,
    Paused { pc: usize },
    Stopped,
    Stepped { pc: usize },
    BreakpointHit { address: usize },
    /// Program finished; carries the top of the operand stack, if any.
    Halted { result: Option<i32> },
    Faulted(Fault),
    Reset,
}

/// Command sent from [`VmController`] methods to the [`ControlWorker`].
///
/// Each command carries the oneshot channel its result is returned on.
enum ControlCommand {
    Load {
        bytes: Vec<u8>,
        done: oneshot::Sender<ControlResponse>,
    },
    Start {
        done: oneshot::Sender<ControlResponse>,
    },
    Pause {
        done: oneshot::Sender<ControlResponse>,
    },
    Stop {
        done: oneshot::Sender<ControlResponse>,
    },
    Step {
        done: oneshot::Sender<ControlResponse>,
    },
    Reset {
        done: oneshot::Sender<ControlResponse>,
    },
    SetBreakpoint {
        address: usize,
        done: oneshot::Sender<ControlResponse>,
    },
    ClearBreakpoint {
        address: usize,
        done: oneshot::Sender<ControlResponse>,
    },
    IsRunning {
        done: oneshot::Sender<bool>,
    },
    StackDepth {
        done: oneshot::Sender<usize>,
    },
    ProgramCounter {
        done: oneshot::Sender<usize>,
    },
}

/// Handle to a VM running on its own worker task.
///
/// Cloning is not supported; the handle is the single producer of commands.
/// Dropping it (or calling [`VmController::shutdown`]) ends the worker.
pub struct VmController {
    commands: Sender<ControlCommand>,
    events: broadcast::Sender<ControlEvent>,
    worker: JoinHandle<VM>,
}

impl VmController {
    /// Spawns a worker owning a fresh VM built from `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: VMConfig) -> Result<Self, VMError> {
        Self::spawn_with_slice(config, DEFAULT_SLICE)
    }

    /// Like [`VmController::spawn`] with a custom number of cycles per slice.
    pub fn spawn_with_slice(config: VMConfig, slice: u64) -> Result<Self, VMError> {
        Ok(Self::from_vm(VM::new(config)?, slice))
    }

    /// Moves an existing VM onto a new worker task.
    pub fn from_vm(vm: VM, slice: u64) -> Self {
        let (commands, rx) = channel::<ControlCommand>(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let worker = ControlWorker {
            vm,
            slice: slice.max(1),
            commands: rx,
            events: events.clone(),
        };
        let worker = tokio::spawn(worker.run());
        Self {
            commands,
            events,
            worker,
        }
    }

    /// Subscribes to state-change events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Loads a program artifact or raw bytecode.
    pub async fn load(&self, bytes: Vec<u8>) -> ControlResponse {
        self.request(|done| ControlCommand::Load { bytes, done }).await
    }

    pub async fn load_program(&self, program: &Program) -> ControlResponse {
        self.load(program.to_bytes()).await
    }

    /// Starts or resumes execution in the background.
    pub async fn start(&self) -> ControlResponse {
        self.request(|done| ControlCommand::Start { done }).await
    }

    pub async fn pause(&self) -> ControlResponse {
        self.request(|done| ControlCommand::Pause { done }).await
    }

    pub async fn stop(&self) -> ControlResponse {
        self.request(|done| ControlCommand::Stop { done }).await
    }

    /// Executes one instruction; a running machine is paused first.
    pub async fn step(&self) -> ControlResponse {
        self.request(|done| ControlCommand::Step { done }).await
    }

    pub async fn reset(&self) -> ControlResponse {
        self.request(|done| ControlCommand::Reset { done }).await
    }

    pub async fn set_breakpoint(&self, address: usize) -> ControlResponse {
        self.request(|done| ControlCommand::SetBreakpoint { address, done })
            .await
    }

    pub async fn clear_breakpoint(&self, address: usize) -> ControlResponse {
        self.request(|done| ControlCommand::ClearBreakpoint { address, done })
            .await
    }

    pub async fn is_running(&self) -> Result<bool, VMError> {
        self.query(|done| ControlCommand::IsRunning { done }).await
    }

    pub async fn stack_depth(&self) -> Result<usize, VMError> {
        self.query(|done| ControlCommand::StackDepth { done }).await
    }

    pub async fn program_counter(&self) -> Result<usize, VMError> {
        self.query(|done| ControlCommand::ProgramCounter { done })
            .await
    }

    /// Closes the command channel and returns the VM once the worker exits.
    pub async fn shutdown(self) -> Result<VM, VMError> {
        let Self {
            commands, worker, ..
        } = self;
        drop(commands);
        worker.await.map_err(|_| VMError::ControllerClosed)
    }

    async fn request<F>(&self, make: F) -> ControlResponse
    where
        F: FnOnce(oneshot::Sender<ControlResponse>) -> ControlCommand,
    {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).await.is_err() {
            error!("controller: failed to enqueue command");
            return ControlResponse::failed(VMError::ControllerClosed);
        }
        rx.await
            .unwrap_or_else(|_| ControlResponse::failed(VMError::ControllerClosed))
    }

    async fn query<T, F>(&self, make: F) -> Result<T, VMError>
    where
        F: FnOnce(oneshot::Sender<T>) -> ControlCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| VMError::ControllerClosed)?;
        rx.await.map_err(|_| VMError::ControllerClosed)
    }
}

/// Worker task that exclusively owns the VM.
struct ControlWorker {
    vm: VM,
    slice: u64,
    commands: Receiver<ControlCommand>,
    events: broadcast::Sender<ControlEvent>,
}

impl ControlWorker {
    /// Runs until every command sender is dropped.
    ///
    /// Commands take priority; while the machine is running and no command
    /// is pending, one slice of cycles is executed per iteration.
    async fn run(mut self) -> VM {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = std::future::ready(()), if self.vm.is_running() => {
                    self.run_slice();
                    tokio::task::yield_now().await;
                }
            }
        }
        info!("controller shut down at pc {}", self.vm.program_counter());
        self.vm
    }

    fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Load { bytes, done } => {
                let response = match self.vm.load_bytes(&bytes) {
                    Ok(()) => {
                        let words = self.vm.program().code.len();
                        self.publish(ControlEvent::Loaded { words });
                        ControlResponse::ok(format!("loaded {words} words"))
                    }
                    Err(err) => ControlResponse::failed(err),
                };
                let _ = done.send(response);
            }
            ControlCommand::Start { done } => {
                let _ = done.send(self.start());
            }
            ControlCommand::Pause { done } => {
                let response = match self.vm.pause() {
                    Ok(()) => {
                        let pc = self.vm.program_counter();
                        self.publish(ControlEvent::Paused { pc });
                        ControlResponse::ok(format!("paused at {pc}"))
                    }
                    Err(err) => ControlResponse::failed(err),
                };
                let _ = done.send(response);
            }
            ControlCommand::Stop { done } => {
                let response = if self.vm.is_loaded() {
                    self.vm.stop();
                    self.publish(ControlEvent::Stopped);
                    ControlResponse::ok(format!("stopped ({})", self.vm.state().as_str()))
                } else {
                    ControlResponse::failed(VMError::NoProgram)
                };
                let _ = done.send(response);
            }
            ControlCommand::Step { done } => {
                let _ = done.send(self.step());
            }
            ControlCommand::Reset { done } => {
                let response = match self.vm.reset() {
                    Ok(()) => {
                        self.publish(ControlEvent::Reset);
                        ControlResponse::ok("reset")
                    }
                    Err(err) => ControlResponse::failed(err),
                };
                let _ = done.send(response);
            }
            ControlCommand::SetBreakpoint { address, done } => {
                let response = match self.vm.set_breakpoint(address) {
                    Ok(()) => ControlResponse::ok(format!("breakpoint set at {address}")),
                    Err(err) => ControlResponse::failed(err),
                };
                let _ = done.send(response);
            }
            ControlCommand::ClearBreakpoint { address, done } => {
                let response = if self.vm.clear_breakpoint(address) {
                    ControlResponse::ok(format!("breakpoint cleared at {address}"))
                } else {
                    ControlResponse::ok(format!("no breakpoint at {address}"))
                };
                let _ = done.send(response);
            }
            ControlCommand::IsRunning { done } => {
                let _ = done.send(self.vm.is_running());
            }
            ControlCommand::StackDepth { done } => {
                let _ = done.send(self.vm.stack_depth());
            }
            ControlCommand::ProgramCounter { done } => {
                let _ = done.send(self.vm.program_counter());
            }
        }
    }

    fn start(&mut self) -> ControlResponse {
        if self.vm.is_running() {
            return ControlResponse::ok("already running");
        }
        // One slice runs inline so an immediate halt or fault is reported
        // in the reply; the rest continues from the worker loop.
        match self.vm.run_slice(self.slice) {
            Ok(outcome) => {
                self.publish(ControlEvent::Started);
                self.report(outcome);
                ControlResponse::ok(match outcome {
                    RunOutcome::Yielded => "running".to_string(),
                    RunOutcome::Halted => "halted".to_string(),
                    RunOutcome::Breakpoint(address) => format!("breakpoint at {address}"),
                })
            }
            Err(VMError::Fault(fault)) => {
                self.publish(ControlEvent::Started);
                self.publish(ControlEvent::Faulted(fault.clone()));
                ControlResponse::failed(VMError::Fault(fault))
            }
            Err(err) => ControlResponse::failed(err),
        }
    }

    fn step(&mut self) -> ControlResponse {
        if self.vm.is_running() {
            let _ = self.vm.pause();
        }
        match self.vm.step() {
            Ok(state) => {
                let pc = self.vm.program_counter();
                self.publish(ControlEvent::Stepped { pc });
                if state == MachineState::Halted {
                    self.publish(ControlEvent::Halted {
                        result: self.vm.top().map(|v| v.raw()),
                    });
                }
                ControlResponse::ok(format!("{} at {pc}", state.as_str()))
            }
            Err(VMError::Fault(fault)) => {
                self.publish(ControlEvent::Faulted(fault.clone()));
                ControlResponse::failed(VMError::Fault(fault))
            }
            Err(err) => ControlResponse::failed(err),
        }
    }

    fn run_slice(&mut self) {
        match self.vm.run_slice(self.slice) {
            Ok(outcome) => self.report(outcome),
            Err(VMError::Fault(fault)) => {
                warn!("controller: program faulted: {}", fault);
                self.publish(ControlEvent::Faulted(fault));
            }
            Err(err) => error!("controller: run failed: {}", err),
        }
    }

    fn report(&mut self, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Yielded => {}
            RunOutcome::Breakpoint(address) => {
                self.publish(ControlEvent::BreakpointHit { address })
            }
            RunOutcome::Halted => self.publish(ControlEvent::Halted {
                result: self.vm.top().map(|v| v.raw()),
            }),
        }
    }

    fn publish(&self, event: ControlEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::assembler::assemble_source;
    use crate::virtual_machine::errors::FaultKind;
    use std::time::Duration;
    use tokio::time::timeout;

    const LOOP: &str = ".def main: args=0, locals=1\ntop:\n    load 0\n    iconst 1\n    iadd\n    store 0\n    br top\n";

    fn bytes(source: &str) -> Vec<u8> {
        assemble_source(source).expect("assembly failed").to_bytes()
    }

    async fn next_event(events: &mut broadcast::Receiver<ControlEvent>) -> ControlEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn load_and_run_to_halt() {
        let controller = VmController::spawn(VMConfig::default()).unwrap();
        let mut events = controller.subscribe();

        let response = controller.load(bytes("iconst 2\niconst 3\nimul\nhalt\n")).await;
        assert!(response.success);
        assert_eq!(response.message, "loaded 4 words");
        assert_eq!(next_event(&mut events).await, ControlEvent::Loaded { words: 4 });

        let response = controller.start().await;
        assert!(response.success, "{}", response.message);
        assert_eq!(next_event(&mut events).await, ControlEvent::Started);
        assert_eq!(
            next_event(&mut events).await,
            ControlEvent::Halted { result: Some(6) }
        );
        assert!(!controller.is_running().await.unwrap());
        assert_eq!(controller.stack_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn commands_without_program_fail() {
        let controller = VmController::spawn(VMConfig::default()).unwrap();
        let response = controller.start().await;
        assert!(!response.success);
        assert_eq!(response.error, Some(VMError::NoProgram));
        assert_eq!(response.message, "no program loaded");

        assert!(!controller.set_breakpoint(0).await.success);
        assert!(!controller.reset().await.success);
        assert!(!controller.stop().await.success);
    }

    #[tokio::test]
    async fn load_rejects_bad_bytes() {
        let controller = VmController::spawn(VMConfig::default()).unwrap();
        let response = controller.load(vec![0, 0, 0]).await;
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn pause_interrupts_long_running_program() {
        let controller = VmController::spawn_with_slice(VMConfig::default(), 64).unwrap();
        assert!(controller.load(bytes(LOOP)).await.success);
        assert!(controller.start().await.success);
        assert!(controller.is_running().await.unwrap());

        let response = controller.pause().await;
        assert!(response.success, "{}", response.message);
        assert!(!controller.is_running().await.unwrap());
        assert!(controller.program_counter().await.unwrap() < 5);

        let vm = controller.shutdown().await.unwrap();
        assert_eq!(vm.state(), MachineState::Paused);
        assert!(vm.steps() >= 64);
    }

    #[tokio::test]
    async fn stop_halts_and_reset_restarts() {
        let controller = VmController::spawn_with_slice(VMConfig::default(), 32).unwrap();
        assert!(controller.load(bytes(LOOP)).await.success);
        assert!(controller.start().await.success);
        assert!(controller.stop().await.success);
        assert!(!controller.is_running().await.unwrap());
        assert!(!controller.start().await.success);

        assert!(controller.reset().await.success);
        assert_eq!(controller.program_counter().await.unwrap(), 0);
        assert_eq!(controller.stack_depth().await.unwrap(), 0);
        assert!(controller.start().await.success);
        assert!(controller.is_running().await.unwrap());
        assert!(controller.stop().await.success);
    }

    #[tokio::test]
    async fn breakpoint_is_reported() {
        let controller = VmController::spawn(VMConfig::default()).unwrap();
        assert!(controller.load(bytes(LOOP)).await.success);
        assert!(controller.set_breakpoint(4).await.success);
        let mut events = controller.subscribe();

        let response = controller.start().await;
        assert_eq!(response.message, "breakpoint at 4");
        assert_eq!(next_event(&mut events).await, ControlEvent::Started);
        assert_eq!(
            next_event(&mut events).await,
            ControlEvent::BreakpointHit { address: 4 }
        );
        assert_eq!(controller.program_counter().await.unwrap(), 4);
        assert!(!controller.is_running().await.unwrap());

        // Resuming runs the loop once more back onto the same breakpoint.
        controller.start().await;
        assert_eq!(next_event(&mut events).await, ControlEvent::Started);
        assert_eq!(
            next_event(&mut events).await,
            ControlEvent::BreakpointHit { address: 4 }
        );

        assert!(controller.clear_breakpoint(4).await.success);
        let response = controller.clear_breakpoint(4).await;
        assert_eq!(response.message, "no breakpoint at 4");
        let response = controller.set_breakpoint(99).await;
        assert_eq!(
            response.error,
            Some(VMError::InvalidAddress {
                address: 99,
                len: 5
            })
        );
    }

    #[tokio::test]
    async fn step_walks_one_instruction() {
        let controller = VmController::spawn(VMConfig::default()).unwrap();
        assert!(controller.load(bytes("iconst 7\niconst 1\nhalt\n")).await.success);
        let mut events = controller.subscribe();

        let response = controller.step().await;
        assert_eq!(response.message, "paused at 1");
        assert_eq!(next_event(&mut events).await, ControlEvent::Stepped { pc: 1 });
        assert_eq!(controller.stack_depth().await.unwrap(), 1);

        controller.step().await;
        let response = controller.step().await;
        assert!(response.success);
        assert!(response.message.starts_with("halted"));
        assert_eq!(next_event(&mut events).await, ControlEvent::Stepped { pc: 2 });
        next_event(&mut events).await;
        assert_eq!(
            next_event(&mut events).await,
            ControlEvent::Halted { result: Some(1) }
        );
        assert!(!controller.step().await.success);
    }

    #[tokio::test]
    async fn fault_is_published() {
        let controller = VmController::spawn(VMConfig::default()).unwrap();
        assert!(controller.load(bytes("iconst 1\niconst 0\nidiv\nhalt\n")).await.success);
        let mut events = controller.subscribe();

        let response = controller.start().await;
        assert!(!response.success);
        let fault = match response.error {
            Some(VMError::Fault(fault)) => fault,
            other => panic!("expected a fault, got {other:?}"),
        };
        assert_eq!(fault.kind, FaultKind::DivisionByZero);
        assert_eq!(fault.pc, 2);

        assert_eq!(next_event(&mut events).await, ControlEvent::Started);
        assert_eq!(next_event(&mut events).await, ControlEvent::Faulted(fault));
    }

    #[tokio::test]
    async fn shutdown_returns_the_vm() {
        let controller = VmController::spawn(VMConfig::default()).unwrap();
        assert!(controller.load(bytes("iconst 5\nhalt\n")).await.success);
        assert!(controller.start().await.success);
        let vm = controller.shutdown().await.unwrap();
        assert_eq!(vm.state(), MachineState::Halted);
        assert_eq!(vm.top().map(|v| v.raw()), Some(5));
    }
}
