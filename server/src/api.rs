//! # Agent-Facing HTTP Endpoints
//!
//! The small read-only surface the core itself exposes: discovery of
//! connected agents and the bootstrap installer served to new nodes.
//! The admin CRUD API lives in the outer layer.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Response item representing a single connected agent.
#[derive(Serialize)]
pub struct AgentListItem {
    pub node_id: u32,
    pub name: String,
}

/// `GET /api/v1/agents` — all currently connected agents.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentListItem>> {
    let agents = state
        .hub
        .connected_agents()
        .into_iter()
        .map(|(node_id, name)| AgentListItem { node_id, name })
        .collect();
    Json(agents)
}

/// `GET /api/v1/node-agent/install.sh` — shell installer for new nodes.
///
/// The operator runs it with `-a <panel> -s <secret>` (the exact command
/// comes from the node's install-command endpoint); it drops a systemd
/// unit that keeps the agent connected to this controller.
pub async fn install_script(State(state): State<AppState>) -> impl IntoResponse {
    let script = render_install_script(&state.panel_addr);
    ([(header::CONTENT_TYPE, "text/x-shellscript")], script)
}

fn render_install_script(panel_addr: &str) -> String {
    format!(
        r#"#!/bin/sh
# fabric agent bootstrap
set -e

PANEL_ADDR="{panel_addr}"
SECRET=""

while getopts "a:s:" opt; do
  case "$opt" in
    a) PANEL_ADDR="$OPTARG" ;;
    s) SECRET="$OPTARG" ;;
    *) echo "usage: $0 -a <panel_addr> -s <secret>" >&2; exit 1 ;;
  esac
done

if [ -z "$SECRET" ]; then
  echo "missing -s <secret>" >&2
  exit 1
fi

install -d /opt/fabric-agent
curl -fsSL "$PANEL_ADDR/api/v1/node-agent/binary" -o /opt/fabric-agent/fabric-agent
chmod +x /opt/fabric-agent/fabric-agent

cat > /etc/systemd/system/fabric-agent.service <<EOF
[Unit]
Description=Fabric forwarding agent
After=network-online.target

[Service]
ExecStart=/opt/fabric-agent/fabric-agent -a $PANEL_ADDR -s $SECRET
Restart=always
RestartSec=3

[Install]
WantedBy=multi-user.target
EOF

systemctl daemon-reload
systemctl enable --now fabric-agent
echo "fabric agent installed and started"
"#
    )
}
