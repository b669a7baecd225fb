use serde::{Deserialize, Serialize};

/// wire request, tagged on `operation` per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Request {
    Mount {
        node_id: String,
        job_id: i64,
        target_id: String,
        #[serde(default)]
        token: String,
    },
    Unmount {
        node_id: String,
        job_id: i64,
        target_id: String,
    },
}

impl Request {
    pub fn node_id(&self) -> &str {
        match self {
            Request::Mount { node_id, .. } => node_id,
            Request::Unmount { node_id, .. } => node_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    pub success: bool,
    pub message: String,
    pub server_node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    /// mount: whether this job reused an already-held ledger entry instead
    /// of taking a fresh one (e.g. a retried request).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reused_existing: Option<bool>,
    /// mount: whether this call actually performed the underlying mount
    /// syscall/process spawn, as opposed to joining an already-mounted target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physically_mounted: Option<bool>,
    /// unmount: whether this call actually tore down the underlying mount,
    /// as opposed to just dropping this job's reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physically_unmounted: Option<bool>,
    /// unmount: active jobs still holding the target after this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_mounts_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Response {
    pub fn mount_ok(
        server_node_id: impl Into<String>,
        mount_path: String,
        reused_existing: bool,
        physically_mounted: bool,
    ) -> Self {
        Response {
            success: true,
            message: "ok".into(),
            server_node_id: server_node_id.into(),
            mount_path: Some(mount_path),
            reused_existing: Some(reused_existing),
            physically_mounted: Some(physically_mounted),
            ..Default::default()
        }
    }

    pub fn unmount_ok(
        server_node_id: impl Into<String>,
        physically_unmounted: bool,
        active_mounts_remaining: i64,
    ) -> Self {
        Response {
            success: true,
            message: "ok".into(),
            server_node_id: server_node_id.into(),
            physically_unmounted: Some(physically_unmounted),
            active_mounts_remaining: Some(active_mounts_remaining),
            ..Default::default()
        }
    }

    pub fn err(server_node_id: impl Into<String>, message: impl Into<String>, code: &str) -> Self {
        Response {
            success: false,
            message: message.into(),
            server_node_id: server_node_id.into(),
            error_code: Some(code.to_string()),
            ..Default::default()
        }
    }

    /// built when a request was addressed to the wrong node.
    pub fn node_mismatch(
        server_node_id: impl Into<String>,
        request_node_id: impl Into<String>,
    ) -> Self {
        Response {
            success: false,
            message: "request addressed to a different node".to_string(),
            server_node_id: server_node_id.into(),
            request_node_id: Some(request_node_id.into()),
            error_code: Some("bad_request".into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mount_request_deserializes_from_snake_case_json() {
        let json = r#"{"operation":"mount","node_id":"node-1","job_id":42,"target_id":"target-a","token":"tok"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req {
            Request::Mount {
                node_id,
                job_id,
                target_id,
                token,
            } => {
                assert_eq!(node_id, "node-1");
                assert_eq!(job_id, 42);
                assert_eq!(target_id, "target-a");
                assert_eq!(token, "tok");
            }
            _ => panic!("expected Mount"),
        }
    }

    #[test]
    fn unmount_request_round_trips() {
        let req = Request::Unmount {
            node_id: "node-1".into(),
            job_id: 7,
            target_id: "target-a".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_id(), "node-1");
    }

    #[test]
    fn success_response_omits_error_code() {
        let resp = Response::mount_ok("node-1", "/mnt/trilio/target-a".into(), false, true);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("error_code"));
    }

    #[test]
    fn mount_ok_carries_physical_mount_flags() {
        let resp = Response::mount_ok("node-1", "/mnt/trilio/target-a".into(), true, false);
        assert_eq!(resp.reused_existing, Some(true));
        assert_eq!(resp.physically_mounted, Some(false));
    }

    #[test]
    fn unmount_ok_carries_remaining_count() {
        let resp = Response::unmount_ok("node-1", true, 0);
        assert_eq!(resp.physically_unmounted, Some(true));
        assert_eq!(resp.active_mounts_remaining, Some(0));
    }
}
