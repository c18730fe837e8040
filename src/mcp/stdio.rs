//! Stdio transport: one JSON message per line
//!
//! Stdout carries protocol traffic only; logs go to stderr.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;

use super::McpServer;

/// Serve on the process's stdin and stdout until stdin closes
pub async fn run(server: McpServer) -> std::io::Result<()> {
    info!("Serving tool protocol on stdio");
    serve_lines(&server, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
    info!("Stdin closed, stopping");
    Ok(())
}

/// Answer each input line in order
pub async fn serve_lines<R, W>(server: &McpServer, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(reply) = server.handle_text(line).await {
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::config::Config;
    use crate::state::AppState;
    use serde_json::Value;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_line_protocol() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            cache: CacheConfig {
                root_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        let server = McpServer::new(AppState::new(config));

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"cache_stats"}}"#,
            "\n",
        );
        let mut output = Vec::new();
        serve_lines(&server, input.as_bytes(), &mut output).await.unwrap();

        let replies: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[1]["id"], 2);
        let stats: Value =
            serde_json::from_str(replies[1]["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(stats["total_size_bytes"], 0);
    }
}
