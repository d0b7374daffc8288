//! Namespaced tool catalog.
//!
//! Sub-server tools are exposed as `"server__tool"` (e.g. `"echo__ping"`).
//! Server names are unique registry keys and neither half may contain the
//! separator, so qualified names never collide and always split back into
//! the same pair.

use super::errors::HostError;
use super::types::{ServerInstance, ServerStatus, ToolDescriptor};

/// Reserved separator between server name and tool name.
pub const SEPARATOR: &str = "__";

// ─── Names ───────────────────────────────────────────────────────────────────

/// Check a server name before it is reserved in the registry.
///
/// Names start with an ASCII letter or digit, continue with letters,
/// digits, `-`, `.` or `_`, never contain `__`, and never end with `_`.
/// The last two rules keep the first `__` of a qualified name at the
/// server/tool boundary.
pub fn validate_server_name(name: &str) -> Result<(), HostError> {
    let invalid = |reason: &str| HostError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let first = name.chars().next().ok_or_else(|| invalid("name is empty"))?;
    if !first.is_ascii_alphanumeric() {
        return Err(invalid("must start with a letter or digit"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')))
    {
        return Err(invalid(&format!("character '{c}' is not allowed")));
    }
    if name.contains(SEPARATOR) {
        return Err(invalid(&format!("must not contain '{SEPARATOR}'")));
    }
    if name.ends_with('_') {
        return Err(invalid("must not end with '_'"));
    }
    Ok(())
}

/// Whether a discovered tool name can be namespaced unambiguously.
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('_') && !name.contains(SEPARATOR)
}

/// Build the catalog name of `tool` on `server`.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}{SEPARATOR}{tool}")
}

/// Split a qualified name at the first separator.
///
/// E.g., `"echo__ping"` → `("echo", "ping")`. Returns `None` when there is
/// no separator or either half is empty.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let (server, tool) = name.split_once(SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

// ─── Aggregation ─────────────────────────────────────────────────────────────

/// Qualified descriptors for every tool of every `running` instance.
///
/// Instances are taken in the order given (the registry lists by name);
/// each server's tools keep their discovery order.
pub fn aggregate(instances: &[ServerInstance]) -> Vec<ToolDescriptor> {
    instances
        .iter()
        .filter(|inst| inst.status == ServerStatus::Running)
        .flat_map(|inst| {
            inst.tools.iter().map(move |tool| ToolDescriptor {
                name: qualify(&inst.name, &tool.name),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
        })
        .collect()
}

/// Source of the host's fixed built-in tool descriptors.
pub trait BuiltinCatalog: Send + Sync {
    fn tools(&self) -> Vec<ToolDescriptor>;
}

/// Built-in catalog backed by a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tools: Vec<ToolDescriptor>,
}

impl StaticCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }
}

impl BuiltinCatalog for StaticCatalog {
    fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }
}

/// Built-ins followed by the aggregated sub-server tools.
///
/// Built-ins containing the separator are dropped: they could shadow a
/// namespaced tool.
pub fn unified_catalog(
    builtins: &dyn BuiltinCatalog,
    instances: &[ServerInstance],
) -> Vec<ToolDescriptor> {
    let mut catalog: Vec<ToolDescriptor> = builtins
        .tools()
        .into_iter()
        .filter(|tool| {
            let ok = !tool.name.contains(SEPARATOR);
            if !ok {
                tracing::warn!(tool = %tool.name, "built-in tool name uses the namespace separator, hiding it");
            }
            ok
        })
        .collect();
    catalog.extend(aggregate(instances));
    catalog
}

/// Descriptors for the host's own management operations.
pub fn host_management_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            "attach_subserver",
            "Launch a sandboxed sub-server from a container image and add its tools to the catalog.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Unique server name; prefixes its tools."},
                    "image": {"type": "string", "description": "Container image (default: mcp/<name>)."},
                    "env": {"type": "object", "additionalProperties": {"type": "string"}}
                },
                "required": ["name"]
            }),
        ),
        ToolDescriptor::new(
            "list_subservers",
            "List attached sub-servers with their status and tool counts.",
            serde_json::json!({"type": "object", "properties": {}}),
        ),
    ]
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn instance(name: &str, status: ServerStatus, tools: &[&str]) -> ServerInstance {
        let mut inst = ServerInstance::launching(name, &format!("test/{name}"));
        inst.status = status;
        inst.tools = tools
            .iter()
            .map(|t| ToolDescriptor::new(t, &format!("{t} tool"), serde_json::json!({})))
            .collect();
        inst
    }

    #[test]
    fn test_validate_server_name() {
        assert!(validate_server_name("echo").is_ok());
        assert!(validate_server_name("git-hub.v2_beta").is_ok());
        for bad in ["", "_echo", "a__b", "echo_", "with space", "a/b"] {
            assert!(
                matches!(validate_server_name(bad), Err(HostError::InvalidName { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_tool_name_rules() {
        assert!(is_valid_tool_name("ping"));
        assert!(is_valid_tool_name("list_dir"));
        assert!(!is_valid_tool_name(""));
        assert!(!is_valid_tool_name("_hidden"));
        assert!(!is_valid_tool_name("a__b"));
    }

    #[test]
    fn test_qualify_and_split() {
        assert_eq!(qualify("echo", "ping"), "echo__ping");
        assert_eq!(split_qualified("echo__ping"), Some(("echo", "ping")));
        assert_eq!(split_qualified("a_b__c_d"), Some(("a_b", "c_d")));
        assert_eq!(split_qualified("ping"), None);
        assert_eq!(split_qualified("__ping"), None);
        assert_eq!(split_qualified("echo__"), None);
    }

    #[test]
    fn test_split_inverts_qualify_for_valid_names() {
        let servers = ["a", "a_b", "a-b", "x.y", "s1"];
        let tools = ["t", "t_", "t_u", "list-dir", "x.y"];
        for server in servers {
            for tool in tools {
                assert!(validate_server_name(server).is_ok());
                assert!(is_valid_tool_name(tool));
                assert_eq!(split_qualified(&qualify(server, tool)), Some((server, tool)));
            }
        }
    }

    #[test]
    fn test_aggregate_only_running() {
        let instances = vec![
            instance("echo", ServerStatus::Running, &["ping"]),
            instance("pending", ServerStatus::Launching, &[]),
            instance("broken", ServerStatus::Error, &["ping"]),
            instance("gone", ServerStatus::Stopped, &["ping"]),
        ];
        let names: Vec<String> = aggregate(&instances).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["echo__ping"]);
    }

    #[test]
    fn test_same_tool_on_two_servers_never_collides() {
        let instances = vec![
            instance("alpha", ServerStatus::Running, &["ping", "search"]),
            instance("beta", ServerStatus::Running, &["ping", "search"]),
        ];
        let tools = aggregate(&instances);
        let unique: HashSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tools.len(), 4);
        assert_eq!(unique.len(), 4);
        assert!(unique.contains("alpha__ping"));
        assert!(unique.contains("beta__ping"));
        assert!(!unique.contains("ping"));
    }

    #[test]
    fn test_aggregate_preserves_descriptor_fields() {
        let mut inst = instance("echo", ServerStatus::Running, &[]);
        inst.tools.push(ToolDescriptor::new(
            "ping",
            "Echo back",
            serde_json::json!({"type": "object", "required": ["msg"]}),
        ));
        let tools = aggregate(&[inst]);
        assert_eq!(tools[0].description, "Echo back");
        assert_eq!(tools[0].input_schema["required"][0], "msg");
    }

    #[test]
    fn test_unified_catalog_builtins_first() {
        let builtins = StaticCatalog::new(vec![
            ToolDescriptor::new("chat_completion", "", serde_json::json!({})),
            ToolDescriptor::new("bad__name", "", serde_json::json!({})),
        ]);
        let instances = vec![instance("echo", ServerStatus::Running, &["ping"])];

        let names: Vec<String> = unified_catalog(&builtins, &instances)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["chat_completion", "echo__ping"]);
    }

    #[test]
    fn test_host_management_tools_are_unqualified() {
        for tool in host_management_tools() {
            assert!(!tool.name.contains(SEPARATOR));
            assert_eq!(tool.input_schema["type"], "object");
        }
    }
}
