//! Instructions pushed from the controller to a worker over its
//! persistent watch channel.
//!
//! Wire shape: a JSON object with exactly one key populated, e.g.
//! `{"portForwardAction": {"session": "...", "vmUID": "...", "port": 0}}`.

use serde::{Deserialize, Serialize};

/// A message delivered at most once per emission over a worker's
/// long-lived watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchInstruction {
    #[serde(rename = "portForwardAction")]
    PortForward(PortForwardAction),
    #[serde(rename = "syncVMsAction")]
    SyncVms(SyncVmsAction),
    #[serde(rename = "resolveIPAction")]
    ResolveIp(ResolveIpAction),
    #[serde(rename = "execAction")]
    Exec(ExecAction),
}

impl WatchInstruction {
    pub fn sync_vms() -> Self {
        WatchInstruction::SyncVms(SyncVmsAction {})
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardAction {
    pub session: String,
    #[serde(rename = "vmUID")]
    pub vm_uid: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncVmsAction {
    // nothing for now
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveIpAction {
    pub session: String,
    #[serde(rename = "vmUID")]
    pub vm_uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecAction {
    pub session: String,
    #[serde(rename = "vmUID")]
    pub vm_uid: String,
    pub command: String,
    pub args: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u32,
    pub cols: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_key_on_the_wire() {
        let instruction = WatchInstruction::PortForward(PortForwardAction {
            session: "s1".into(),
            vm_uid: "u1".into(),
            port: 8080,
        });

        let value = serde_json::to_value(&instruction).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(object["portForwardAction"]["vmUID"], "u1");
        assert_eq!(object["portForwardAction"]["port"], 8080);
    }

    #[test]
    fn sync_vms_round_trips() {
        let json = serde_json::to_string(&WatchInstruction::sync_vms()).unwrap();
        assert_eq!(json, r#"{"syncVMsAction":{}}"#);

        let parsed: WatchInstruction = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, WatchInstruction::sync_vms());
    }

    #[test]
    fn resolve_ip_uses_vm_uid_key() {
        let instruction = WatchInstruction::ResolveIp(ResolveIpAction {
            session: "s2".into(),
            vm_uid: "u2".into(),
        });

        let value = serde_json::to_value(&instruction).unwrap();
        assert_eq!(value["resolveIPAction"]["session"], "s2");
        assert_eq!(value["resolveIPAction"]["vmUID"], "u2");
    }
}
