//! 配置解析模块
//!
//! 支持 TOML (主要) 和 JSON (可选) 格式。所有段落均可省略，缺省值见 `NodeConfig`。

use contracts::{ContractError, NodeConfig};

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML 格式 (推荐)
    Toml,
    /// JSON 格式
    Json,
}

impl ConfigFormat {
    /// 从文件扩展名推断格式
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// 解析 TOML 格式配置
pub fn parse_toml(content: &str) -> Result<NodeConfig, ContractError> {
    toml::from_str(content).map_err(|e| ContractError::ConfigParse {
        message: format!("TOML parse error: {e}"),
        source: Some(Box::new(e)),
    })
}

/// 解析 JSON 格式配置
pub fn parse_json(content: &str) -> Result<NodeConfig, ContractError> {
    serde_json::from_str(content).map_err(|e| ContractError::ConfigParse {
        message: format!("JSON parse error: {e}"),
        source: Some(Box::new(e)),
    })
}

/// 根据格式解析配置
pub fn parse(content: &str, format: ConfigFormat) -> Result<NodeConfig, ContractError> {
    match format {
        ConfigFormat::Toml => parse_toml(content),
        ConfigFormat::Json => parse_json(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_partial() {
        let content = r#"
[keepalive]
interval_ms = 500

[link]
loss_rate = 0.05
"#;
        let config = parse_toml(content).unwrap();
        assert_eq!(config.keepalive.interval_ms, 500);
        assert_eq!(config.keepalive.timeout_multiple, 6);
        assert_eq!(config.link.loss_rate, 0.05);
        assert_eq!(config.link.max_payload, 512);
        assert_eq!(config.schedule, Default::default());
    }

    #[test]
    fn test_parse_empty_document_is_default() {
        assert_eq!(parse_toml("").unwrap(), NodeConfig::default());
        assert_eq!(parse_json("{}").unwrap(), NodeConfig::default());
    }

    #[test]
    fn test_parse_json_sections() {
        let content = r#"{
            "macrocycle": { "max_events": 6, "max_fingers": 5 },
            "latency": { "enabled": true, "verbose": true }
        }"#;
        let config = parse_json(content).unwrap();
        assert_eq!(config.macrocycle.max_events, 6);
        assert_eq!(config.macrocycle.max_fingers, 5);
        assert!(config.latency.enabled && config.latency.verbose);
    }

    #[test]
    fn test_parse_toml_syntax_error() {
        let result = parse_toml("invalid toml [[[");
        assert!(matches!(result, Err(ContractError::ConfigParse { .. })));
    }

    #[test]
    fn test_parse_wrong_type() {
        let result = parse_toml("[keepalive]\ninterval_ms = \"fast\"\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("TOML parse error"), "got: {err}");
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_extension("toml"), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_extension("TOML"), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_extension("json"), Some(ConfigFormat::Json));
        assert_eq!(ConfigFormat::from_extension("yaml"), None);
    }
}
