//! The local control endpoint.
//!
//! A loopback-only TCP listener for credential administration: one JSON
//! object per line in, one JSON object per line out. Status 0 is success,
//! 1 is failure with an error message.

use std::sync::Arc;

use anyhow::Context;
use scio::line::LineReader;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::server::Server;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum CtlRequest {
    AddAuth {
        username: String,
        password: String,
        role: String,
    },
    RmAuth {
        username: String,
    },
}

#[derive(Debug, Serialize)]
struct CtlResponse {
    status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CtlResponse {
    fn ok() -> Self {
        Self {
            status: 0,
            error: None,
        }
    }

    fn err(e: impl std::fmt::Display) -> Self {
        Self {
            status: 1,
            error: Some(e.to_string()),
        }
    }
}

pub async fn listen(srv: Arc<Server>) {
    let addr = format!("127.0.0.1:{}", srv.config.control_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            srv.fatal(anyhow::anyhow!("couldn't listen on control port: {e}"))
                .await;
            return;
        }
    };
    info!(port = srv.config.control_port, "listening for control connections");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!(err = %e, "control accept error");
                continue;
            }
        };
        let srv = srv.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(srv, stream).await {
                debug!(peer = %peer, err = %e, "control connection ended with error");
            }
        });
    }
}

async fn handle_conn(srv: Arc<Server>, stream: TcpStream) -> anyhow::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut lr = LineReader::new(rd);
    while let Some(line) = lr.read_line().await.context("read control line")? {
        if line.is_empty() {
            continue;
        }
        let resp = match serde_json::from_slice::<CtlRequest>(&line) {
            Ok(req) => execute(&srv, req),
            Err(e) => CtlResponse::err(format!("bad request: {e}")),
        };
        let mut out = serde_json::to_string(&resp).context("encode control response")?;
        out.push('\n');
        wr.write_all(out.as_bytes())
            .await
            .context("write control response")?;
    }
    Ok(())
}

fn execute(srv: &Server, req: CtlRequest) -> CtlResponse {
    match req {
        CtlRequest::AddAuth {
            username,
            password,
            role,
        } => match srv.db.add_auth(&username, &password, &role) {
            Ok(()) => {
                info!(%username, %role, "control: user added");
                CtlResponse::ok()
            }
            Err(e) => CtlResponse::err(e),
        },
        CtlRequest::RmAuth { username } => match srv.db.remove_auth(&username) {
            Ok(()) => {
                info!(%username, "control: user removed");
                CtlResponse::ok()
            }
            Err(e) => CtlResponse::err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testutil::test_server;

    #[test]
    fn add_and_remove_auth() {
        let srv = test_server();
        let req: CtlRequest = serde_json::from_str(
            r#"{"op":"add_auth","username":"root","password":"toor1234","role":"Admin"}"#,
        )
        .unwrap();
        let resp = execute(&srv, req);
        assert_eq!(resp.status, 0);
        assert_eq!(
            srv.db.check_auth("root", "toor1234").unwrap(),
            (true, "Admin".to_string())
        );

        // Duplicate insert reports failure, status 1.
        let req: CtlRequest = serde_json::from_str(
            r#"{"op":"add_auth","username":"root","password":"x","role":"Admin"}"#,
        )
        .unwrap();
        let resp = execute(&srv, req);
        assert_eq!(resp.status, 1);
        assert!(resp.error.is_some());

        let req: CtlRequest =
            serde_json::from_str(r#"{"op":"rm_auth","username":"root"}"#).unwrap();
        let resp = execute(&srv, req);
        assert_eq!(resp.status, 0);
        assert_eq!(
            srv.db.check_auth("root", "toor1234").unwrap(),
            (false, String::new())
        );
    }

    #[test]
    fn response_wire_shape() {
        assert_eq!(
            serde_json::to_string(&CtlResponse::ok()).unwrap(),
            r#"{"status":0}"#
        );
        assert_eq!(
            serde_json::to_string(&CtlResponse::err("boom")).unwrap(),
            r#"{"status":1,"error":"boom"}"#
        );
    }

    #[test]
    fn unknown_op_is_a_bad_request() {
        assert!(serde_json::from_str::<CtlRequest>(r#"{"op":"drop_tables"}"#).is_err());
    }
}
