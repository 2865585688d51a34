//! Line-oriented operator console for a running service.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

use crate::service::ServiceHandle;
use crate::signal::Interrupt;

const PROMPT: &str = "neodock> ";
const DEFAULT_LOG_TAIL: usize = 20;

const HELP: &str = "\
Commands:
  help               show this text
  env                print the service environment
  ls                 list members with role, state and addresses
  logs MEMBER [N]    show the last N log lines of a member (default 20)
  inspect MEMBER     show a member's launch spec as JSON
  exit               stop the service and quit
";

/// Why the console stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    Exit,
    EndOfInput,
    Interrupted,
}

pub struct Console<R, W> {
    lines: Lines<R>,
    output: W,
    interrupt: Interrupt,
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(input: R, output: W, interrupt: Interrupt) -> Self {
        Self {
            lines: input.lines(),
            output,
            interrupt,
        }
    }

    /// Reads and runs commands until `exit`, end of input or an interrupt.
    /// Never tears the service down itself; that is left to the owner.
    pub async fn run(&mut self, service: &ServiceHandle) -> io::Result<ConsoleExit> {
        self.print_env(service).await?;
        self.write("Type `help` for a list of commands.\n").await?;

        loop {
            self.write(PROMPT).await?;
            let line = tokio::select! {
                line = self.lines.next_line() => line?,
                _ = self.interrupt.triggered() => {
                    self.write("\n").await?;
                    return Ok(ConsoleExit::Interrupted);
                }
            };
            let Some(line) = line else {
                self.write("\n").await?;
                return Ok(ConsoleExit::EndOfInput);
            };
            if self.dispatch(service, line.trim()).await? {
                return Ok(ConsoleExit::Exit);
            }
        }
    }

    /// Returns true when the operator asked to quit.
    async fn dispatch(&mut self, service: &ServiceHandle, line: &str) -> io::Result<bool> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(false);
        };
        let args: Vec<&str> = words.collect();

        match (command, args.as_slice()) {
            ("exit" | "quit", _) => return Ok(true),
            ("help", _) => self.write(HELP).await?,
            ("env", _) => self.print_env(service).await?,
            ("ls", _) => self.list(service).await?,
            ("logs", [member]) => self.logs(service, member, DEFAULT_LOG_TAIL).await?,
            ("logs", [member, tail]) => match tail.parse() {
                Ok(tail) => self.logs(service, member, tail).await?,
                Err(_) => self.write(&format!("not a line count: {:?}\n", tail)).await?,
            },
            ("inspect", [member]) => self.inspect(service, member).await?,
            ("logs" | "inspect", _) => {
                self.write(&format!("usage: {} MEMBER\n", command)).await?
            }
            _ => {
                self.write(&format!(
                    "unknown command {:?}, type `help` for a list\n",
                    command
                ))
                .await?
            }
        }
        Ok(false)
    }

    async fn print_env(&mut self, service: &ServiceHandle) -> io::Result<()> {
        let mut text = String::new();
        for (name, value) in service.env() {
            text.push_str(&format!("{}={:?}\n", name, value));
        }
        self.write(&text).await
    }

    async fn list(&mut self, service: &ServiceHandle) -> io::Result<()> {
        let mut text = String::new();
        for record in service.members() {
            text.push_str(&format!(
                "{:<16} {:<13} {:<9} bolt={} http={}\n",
                record.spec.name,
                record.spec.role.to_string(),
                record.state.to_string(),
                record.spec.bolt_address(),
                record.spec.http_address(),
            ));
        }
        self.write(&text).await
    }

    async fn logs(&mut self, service: &ServiceHandle, member: &str, tail: usize) -> io::Result<()> {
        let Some(record) = service.member(member) else {
            return self.no_such_member(member).await;
        };
        match service.logs(record, tail).await {
            Ok(lines) => {
                let mut text = lines.join("\n");
                text.push('\n');
                self.write(&text).await
            }
            Err(e) => self.write(&format!("error: {}\n", e)).await,
        }
    }

    async fn inspect(&mut self, service: &ServiceHandle, member: &str) -> io::Result<()> {
        let Some(record) = service.member(member) else {
            return self.no_such_member(member).await;
        };
        let mut text = serde_json::to_string_pretty(record)?;
        text.push('\n');
        self.write(&text).await
    }

    async fn no_such_member(&mut self, member: &str) -> io::Result<()> {
        self.write(&format!("no such member: {:?}\n", member)).await
    }

    async fn write(&mut self, text: &str) -> io::Result<()> {
        self.output.write_all(text.as_bytes()).await?;
        self.output.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Overrides, RunConfig, Settings};
    use crate::runtime::fake::FakeEngine;
    use crate::types::Auth;
    use log::LevelFilter;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::BufReader;

    async fn service(engine: &Arc<FakeEngine>) -> ServiceHandle {
        let mut settings = Settings::default();
        settings.poll_interval_ms = 5;
        let run = RunConfig {
            image: "neo4j:4.0".into(),
            auth: Auth {
                user: "neo4j".into(),
                password: "secret".into(),
            },
            config: Overrides::new(),
            env: Overrides::new(),
            network_name: Some("svc".into()),
            instance_count: 1,
            read_replicas: 0,
            log_level: LevelFilter::Info,
            command: Vec::new(),
            settings,
        };
        ServiceHandle::start(engine.clone(), &run, &mut Interrupt::channel().1)
            .await
            .unwrap()
    }

    async fn run_script(script: &str) -> (ConsoleExit, String) {
        let engine = Arc::new(FakeEngine::new().with_image("neo4j:4.0"));
        let handle = service(&engine).await;
        let mut output = Vec::new();
        let exit = {
            let mut console = Console::new(
                BufReader::new(script.as_bytes()),
                &mut output,
                Interrupt::channel().1,
            );
            console.run(&handle).await.unwrap()
        };
        handle.close(Ok(())).await.unwrap();
        (exit, String::from_utf8(output).unwrap())
    }

    #[tokio::test]
    async fn prints_environment_on_start() {
        let (exit, output) = run_script("exit\n").await;
        assert_eq!(exit, ConsoleExit::Exit);
        assert!(output.starts_with("BOLT_SERVER_ADDR=\"localhost:7687\"\nNEO4J_AUTH=\"neo4j:secret\"\n"));
    }

    #[tokio::test]
    async fn commands_report_on_members() {
        let (exit, output) = run_script("ls\ninspect a\nlogs a 2\nlogs z\nfrobnicate\nexit\n").await;
        assert_eq!(exit, ConsoleExit::Exit);
        assert!(output.contains("a.svc"));
        assert!(output.contains("standalone"));
        assert!(output.contains("Ready"));
        assert!(output.contains("\"role\": \"Standalone\""));
        assert!(output.contains("a.svc line 3"));
        assert!(!output.contains("a.svc line 1"));
        assert!(output.contains("no such member: \"z\""));
        assert!(output.contains("unknown command \"frobnicate\""));
    }

    #[tokio::test]
    async fn end_of_input_stops_the_console() {
        let (exit, _) = run_script("ls\n").await;
        assert_eq!(exit, ConsoleExit::EndOfInput);
    }

    #[tokio::test]
    async fn interrupt_while_waiting_for_input() {
        let engine = Arc::new(FakeEngine::new().with_image("neo4j:4.0"));
        let handle = service(&engine).await;
        // Keep the writing half open so the read blocks.
        let (_keyboard, input) = tokio::io::duplex(64);
        let (tx, interrupt) = Interrupt::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });
        let mut output = Vec::new();
        let exit = Console::new(BufReader::new(input), &mut output, interrupt)
            .run(&handle)
            .await
            .unwrap();
        assert_eq!(exit, ConsoleExit::Interrupted);
        handle.close(Ok(())).await.unwrap();
        assert_eq!(engine.container_count(), 0);
    }
}
