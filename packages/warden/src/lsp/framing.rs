//! Content-Length framing for JSON-RPC 2.0 over language-server stdio.
//!
//! Every message is `Content-Length: <n>\r\n\r\n` followed by `<n>` bytes of
//! UTF-8 JSON. Headers other than Content-Length (servers may send
//! Content-Type) are read and ignored.

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single message body; anything larger is a protocol error.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, message: &serde_json::Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message).context("encode message")?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer
        .write_all(header.as_bytes())
        .await
        .context("write header")?;
    writer.write_all(&body).await.context("write body")?;
    writer.flush().await.context("flush message")?;
    Ok(())
}

/// Read one framed message: headers until a blank line, then exactly
/// Content-Length body bytes.
pub async fn read_message<R>(reader: &mut R) -> Result<serde_json::Value>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.context("read header")?;
        if n == 0 {
            bail!("language server closed its output mid-header");
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            let length = value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("parse Content-Length from {line:?}"))?;
            content_length = Some(length);
        }
    }

    let Some(length) = content_length else {
        bail!("message frame missing Content-Length header");
    };
    if length > MAX_BODY_SIZE {
        bail!("message body of {length} bytes exceeds limit");
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.context("read body")?;
    serde_json::from_slice(&body).context("parse message body")
}
