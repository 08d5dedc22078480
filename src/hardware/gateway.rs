// src/hardware/gateway.rs - Connected tag channel through a TCP tag gateway
//
// The gateway owns the controller's native protocol; this side speaks a line protocol:
//   SLOT <n>             -> OK
//   READ <tag>           -> OK <value>
//   WRITE <tag> <value>  -> OK | ERR <reason>
//   LIST <program>       -> OK <count>
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};

use super::{ChannelError, DeviceChannel, Provenance, TagSession, TagValue};
use crate::config::ControllerConfig;

/// Statistics for command execution
#[derive(Debug, Clone, Default)]
pub struct CommandStats {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub average_response_time: f64,
    pub total_response_time: f64,
}

impl CommandStats {
    fn record(&mut self, ok: bool, elapsed: f64) {
        self.total_commands += 1;
        if ok {
            self.successful_commands += 1;
            self.total_response_time += elapsed;
            self.average_response_time = self.total_response_time / self.successful_commands as f64;
        } else {
            self.failed_commands += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayChannel {
    address: String,
    port: u16,
    slot: u8,
    program: String,
    timeout: Duration,
    stats: Arc<Mutex<CommandStats>>,
}

impl GatewayChannel {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            address: config.address.clone(),
            port: config.gateway_port,
            slot: config.slot,
            program: config.program.clone(),
            timeout: config.command_timeout(),
            stats: Arc::new(Mutex::new(CommandStats::default())),
        }
    }

    pub async fn get_command_stats(&self) -> CommandStats {
        self.stats.lock().await.clone()
    }
}

#[async_trait]
impl DeviceChannel for GatewayChannel {
    async fn connect(&self) -> Result<Box<dyn TagSession>, ChannelError> {
        let endpoint = format!("{}:{}", self.address, self.port);
        tracing::debug!("Opening gateway session to {}", endpoint);

        let stream = match timeout(self.timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ChannelError::Connect {
                    address: endpoint,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ChannelError::Connect {
                    address: endpoint,
                    reason: "connect timed out".to_string(),
                });
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut session = GatewaySession {
            reader: BufReader::new(read_half),
            writer: write_half,
            program: self.program.clone(),
            timeout: self.timeout,
            stats: self.stats.clone(),
            closed: false,
        };
        match session.request(&format!("SLOT {}", self.slot)).await? {
            Reply::Ok(_) => Ok(Box::new(session)),
            Reply::Err(reason) => Err(ChannelError::Connect {
                address: endpoint,
                reason: format!("slot {} refused: {}", self.slot, reason),
            }),
        }
    }

    fn provenance(&self) -> Provenance {
        Provenance::Connected
    }
}

/// One TCP connection; closed when dropped.
///
/// Any transport failure closes the session for good: a late reply may still be in
/// flight, and reading it as the answer to the next command would misreport that command.
pub struct GatewaySession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    program: String,
    timeout: Duration,
    stats: Arc<Mutex<CommandStats>>,
    closed: bool,
}

/// Gateway reply after stripping the status word.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Ok(Option<String>),
    Err(String),
}

fn parse_reply(line: &str) -> Result<Reply, ChannelError> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("OK") {
        let rest = rest.trim();
        Ok(Reply::Ok(if rest.is_empty() { None } else { Some(rest.to_string()) }))
    } else if let Some(rest) = line.strip_prefix("ERR") {
        Ok(Reply::Err(rest.trim().to_string()))
    } else {
        Err(ChannelError::Protocol(format!("unexpected reply '{}'", line)))
    }
}

impl GatewaySession {
    async fn request(&mut self, command: &str) -> Result<Reply, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let start_time = Instant::now();
        let result = self.exchange(command).await;
        if result.is_err() {
            self.closed = true;
        }
        let elapsed = start_time.elapsed().as_secs_f64();

        let ok = matches!(result, Ok(Reply::Ok(_)));
        self.stats.lock().await.record(ok, elapsed);

        match &result {
            Ok(_) => tracing::trace!("Command '{}' completed in {:.3}ms", command, elapsed * 1000.0),
            Err(e) => tracing::debug!("Command '{}' failed: {}", command, e),
        }
        result
    }

    async fn exchange(&mut self, command: &str) -> Result<Reply, ChannelError> {
        let line = format!("{}\n", command);
        match timeout(self.timeout, self.writer.write_all(line.as_bytes())).await {
            Ok(result) => result?,
            Err(_) => return Err(ChannelError::Timeout(command.to_string())),
        }
        self.writer.flush().await?;

        let mut buffer = String::new();
        match timeout(self.timeout, self.reader.read_line(&mut buffer)).await {
            Ok(Ok(0)) => Err(ChannelError::Protocol("gateway closed the connection".to_string())),
            Ok(Ok(_)) => parse_reply(&buffer),
            Ok(Err(e)) => Err(ChannelError::Io(e)),
            Err(_) => Err(ChannelError::Timeout(command.to_string())),
        }
    }
}

#[async_trait]
impl TagSession for GatewaySession {
    async fn read_tag(&mut self, tag: &str) -> Result<TagValue, ChannelError> {
        match self.request(&format!("READ {}", tag)).await? {
            Reply::Ok(Some(value)) => value
                .parse::<TagValue>()
                .map_err(|_| ChannelError::Protocol(format!("non-integer value '{}' for {}", value, tag))),
            Reply::Ok(None) => Err(ChannelError::Protocol(format!("empty read of {}", tag))),
            Reply::Err(reason) => Err(ChannelError::Protocol(format!("read of {} failed: {}", tag, reason))),
        }
    }

    async fn write_tag(&mut self, tag: &str, value: TagValue) -> Result<bool, ChannelError> {
        match self.request(&format!("WRITE {} {}", tag, value)).await? {
            Reply::Ok(_) => Ok(true),
            Reply::Err(reason) => {
                tracing::warn!("Controller refused {} = {}: {}", tag, value, reason);
                Ok(false)
            }
        }
    }

    async fn keep_alive(&mut self) -> Result<(), ChannelError> {
        let command = format!("LIST Program:{}", self.program);
        match self.request(&command).await? {
            Reply::Ok(_) => Ok(()),
            Reply::Err(reason) => Err(ChannelError::Protocol(reason)),
        }
    }
}
