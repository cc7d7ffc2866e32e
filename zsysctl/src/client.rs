use anyhow::{Context, Result};
use slog::{debug, error, info, warn, Logger};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use zsysd::rpc::{LogLevel, Request, Response, ResultRecord};

/// Connect to `socket_path`, send one request, print every log line as it
/// streams back, and return the final result record.
pub async fn call(socket_path: &str, log: &Logger, request: &Request) -> Result<ResultRecord> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connecting to {}", socket_path))?;
    let (read_half, mut write_half) = stream.into_split();

    let mut encoded = serde_json::to_vec(request)?;
    encoded.push(b'\n');
    write_half.write_all(&encoded).await?;

    let mut reader = BufReader::new(read_half);
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            anyhow::bail!("zsysd closed the connection without a result");
        }
        let response: Response = serde_json::from_str(line.trim_end())?;
        match response {
            Response::Log(record) => print_log_line(log, record),
            Response::Result(result) => return Ok(result),
        }
    }
}

fn print_log_line(log: &Logger, record: zsysd::rpc::LogRecord) {
    match record.level {
        LogLevel::Trace | LogLevel::Debug => debug!(log, "{}", record.message),
        LogLevel::Info => info!(log, "{}", record.message),
        LogLevel::Warning => warn!(log, "{}", record.message),
        LogLevel::Error => error!(log, "{}", record.message),
    }
}
