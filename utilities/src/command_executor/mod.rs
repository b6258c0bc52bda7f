use std::{
    fmt::Display,
    sync::mpsc::{Receiver, Sender},
};

use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("device executor is not running")]
    Stopped,
    #[error("device executor dropped the response")]
    ResponseDropped,
}

pub trait Command: Send + 'static {
    type Response: Send + 'static;
    type Error: Display + From<ExecutorError> + Send + 'static;
    type Handler: DeviceHandler<Command = Self>;

    fn name(&self) -> &'static str;

    fn execute(self, handler: &mut Self::Handler) -> Result<Self::Response, Self::Error>;
}

pub trait DeviceHandler: Send + 'static {
    type Command: Command<Handler = Self>;
}

type Reply<C> = oneshot::Sender<Result<<C as Command>::Response, <C as Command>::Error>>;

pub struct GenericCommand<C: Command> {
    command: C,
    response_ch: Reply<C>,
}

impl<C: Command> GenericCommand<C> {
    pub fn new(command: C, response_ch: Reply<C>) -> Self {
        Self {
            command,
            response_ch,
        }
    }

    /// Runs the command and hands the result back. Returns false when the
    /// caller stopped waiting for it.
    pub fn execute(self, handler: &mut C::Handler) -> bool {
        let name = self.command.name();
        let result = self.command.execute(handler);

        if let Err(e) = &result {
            warn!(command = name, error = %e, "Device command failed");
        }

        self.response_ch.send(result).is_ok()
    }
}

/// Runs device commands one at a time on a blocking worker.
///
/// The executor stops once every [`CommandSender`] is dropped; the handler
/// (and the transport it owns) is dropped with it.
pub struct CommandExecutor<H: DeviceHandler> {
    handler: H,
    commands_ch: Receiver<GenericCommand<H::Command>>,
}

impl<H: DeviceHandler> CommandExecutor<H> {
    pub fn new(handler: H) -> (Self, CommandSender<H::Command>) {
        let (sender, commands_ch) = std::sync::mpsc::channel();

        (
            Self {
                handler,
                commands_ch,
            },
            CommandSender::new(sender),
        )
    }

    pub fn run(&mut self) {
        while let Ok(command) = self.commands_ch.recv() {
            if !command.execute(&mut self.handler) {
                debug!("Caller went away before the response was delivered");
            }
        }

        debug!("All command senders dropped, stopping executor");
    }

    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }
}

pub struct CommandSender<C: Command> {
    commands_ch: Sender<GenericCommand<C>>,
}

impl<C: Command> Clone for CommandSender<C> {
    fn clone(&self) -> Self {
        Self {
            commands_ch: self.commands_ch.clone(),
        }
    }
}

impl<C: Command> CommandSender<C> {
    pub fn new(commands_ch: Sender<GenericCommand<C>>) -> Self {
        Self { commands_ch }
    }

    pub async fn send_command(&self, command: C) -> Result<C::Response, C::Error> {
        let (response_ch, response_rx) = oneshot::channel();
        let command = GenericCommand::new(command, response_ch);

        self.commands_ch
            .send(command)
            .map_err(|_| ExecutorError::Stopped)?;

        response_rx
            .await
            .map_err(|_| ExecutorError::ResponseDropped)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    enum CounterError {
        #[error("counter overflow")]
        Overflow,
        #[error(transparent)]
        Executor(#[from] ExecutorError),
    }

    struct Counter {
        value: u8,
        trace: Vec<&'static str>,
    }

    impl DeviceHandler for Counter {
        type Command = CounterCommand;
    }

    enum CounterCommand {
        Add(u8),
        SlowAdd(u8),
        Trace,
    }

    #[derive(Debug, PartialEq)]
    enum CounterResponse {
        Value(u8),
        Trace(Vec<&'static str>),
    }

    impl Command for CounterCommand {
        type Response = CounterResponse;
        type Error = CounterError;
        type Handler = Counter;

        fn name(&self) -> &'static str {
            match self {
                CounterCommand::Add(_) => "add",
                CounterCommand::SlowAdd(_) => "slow_add",
                CounterCommand::Trace => "trace",
            }
        }

        fn execute(self, handler: &mut Counter) -> Result<CounterResponse, CounterError> {
            match self {
                CounterCommand::Add(n) => {
                    handler.trace.push("add");
                    handler.value = handler.value.checked_add(n).ok_or(CounterError::Overflow)?;
                    Ok(CounterResponse::Value(handler.value))
                }
                CounterCommand::SlowAdd(n) => {
                    handler.trace.push("slow_add:start");
                    std::thread::sleep(Duration::from_millis(50));
                    handler.value = handler.value.checked_add(n).ok_or(CounterError::Overflow)?;
                    handler.trace.push("slow_add:end");
                    Ok(CounterResponse::Value(handler.value))
                }
                CounterCommand::Trace => Ok(CounterResponse::Trace(handler.trace.clone())),
            }
        }
    }

    fn counter() -> (CommandExecutor<Counter>, CommandSender<CounterCommand>) {
        CommandExecutor::new(Counter {
            value: 0,
            trace: Vec::new(),
        })
    }

    #[tokio::test]
    async fn commands_never_interleave() {
        let (executor, sender) = counter();
        let handle = executor.spawn();

        let slow = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send_command(CounterCommand::SlowAdd(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fast = sender.send_command(CounterCommand::Add(2)).await.unwrap();
        slow.await.unwrap().unwrap();

        assert_eq!(fast, CounterResponse::Value(3));
        assert_eq!(
            sender.send_command(CounterCommand::Trace).await.unwrap(),
            CounterResponse::Trace(vec!["slow_add:start", "slow_add:end", "add"])
        );

        drop(sender);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn handler_errors_reach_the_caller() {
        let (executor, sender) = counter();
        executor.spawn();

        sender.send_command(CounterCommand::Add(250)).await.unwrap();
        let err = sender.send_command(CounterCommand::Add(10)).await.unwrap_err();

        assert!(matches!(err, CounterError::Overflow));
    }

    #[tokio::test]
    async fn stopped_executor_is_reported() {
        let (executor, sender) = counter();
        drop(executor);

        let err = sender.send_command(CounterCommand::Add(1)).await.unwrap_err();

        assert!(matches!(err, CounterError::Executor(ExecutorError::Stopped)));
    }
}
