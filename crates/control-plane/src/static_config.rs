#[derive(Clone, Debug)]
pub struct StaticConfigItem {
    pub key: &'static str,
    pub description: &'static str,
    pub value_type: &'static str,
    pub default_value: &'static str,
}

pub static STATIC_CONFIG_TABLE: &[StaticConfigItem] = &[
    StaticConfigItem {
        key: "cache.redis_url",
        description: "Redis connection string for the durable session tier (empty keeps sessions in process)",
        value_type: "string",
        default_value: "",
    },
    StaticConfigItem {
        key: "cache.key_prefix",
        description: "Key prefix for durable session records",
        value_type: "string",
        default_value: "mcpgw",
    },
    StaticConfigItem {
        key: "session.absolute_expiration_seconds",
        description: "Absolute lifetime of a session record in the durable tier",
        value_type: "number",
        default_value: "43200",
    },
    StaticConfigItem {
        key: "session.sliding_window_seconds",
        description: "Idle time after which a local session entry is evicted",
        value_type: "number",
        default_value: "3600",
    },
    StaticConfigItem {
        key: "session.sweep_interval_seconds",
        description: "Interval between local session cache sweeps",
        value_type: "number",
        default_value: "600",
    },
    StaticConfigItem {
        key: "cluster.namespace",
        description: "Namespace holding adapter instances",
        value_type: "string",
        default_value: "adapter",
    },
    StaticConfigItem {
        key: "cluster.label_selector",
        description: "Label selector matching adapter instances",
        value_type: "string",
        default_value: "adapter/type=mcp",
    },
    StaticConfigItem {
        key: "cluster.field_selector",
        description: "Field selector restricting instances to running ones",
        value_type: "string",
        default_value: "status.phase=Running",
    },
    StaticConfigItem {
        key: "cluster.domain",
        description: "Cluster DNS domain used to derive instance addresses",
        value_type: "string",
        default_value: "svc.cluster.local",
    },
    StaticConfigItem {
        key: "cluster.adapter_port",
        description: "Port adapters listen on",
        value_type: "number",
        default_value: "8000",
    },
    StaticConfigItem {
        key: "cluster.retry_backoff_seconds",
        description: "Delay before relisting after the instance watch ends",
        value_type: "number",
        default_value: "10",
    },
    StaticConfigItem {
        key: "cluster.static_backends",
        description: "Fixed adapter backends as name=url pairs separated by commas (bypasses the cluster registry)",
        value_type: "string",
        default_value: "",
    },
    StaticConfigItem {
        key: "proxy.connect_timeout_ms",
        description: "Backend connect timeout in milliseconds",
        value_type: "number",
        default_value: "10000",
    },
    StaticConfigItem {
        key: "proxy.user_agent",
        description: "User agent sent to backends when the client supplied none",
        value_type: "string",
        default_value: "mcpgw-gateway",
    },
];
