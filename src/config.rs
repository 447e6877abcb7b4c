use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};

use crate::rule::{Rule, RuleKind, SourceAddress, Target};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub tcp: Vec<TcpRuleConfig>,
    #[serde(default)]
    pub http: Vec<HttpRuleConfig>,
    #[serde(default)]
    pub ws: Vec<WsRuleConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_ip")]
    pub ip: IpAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: default_listen_ip(),
        }
    }
}

const fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

#[derive(Debug, Deserialize)]
pub struct TcpRuleConfig {
    pub local_port: u16,
    pub target_address: String,
    #[serde(default)]
    pub source_address: String,
}

#[derive(Debug, Deserialize)]
pub struct HttpRuleConfig {
    pub local_port: u16,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub source_address: String,
}

#[derive(Debug, Deserialize)]
pub struct WsRuleConfig {
    pub local_port: u16,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub source_address: String,
    #[serde(default)]
    pub secure: bool,
    pub ca_file: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

impl Config {
    /// Validates every section into typed rules: tcp first, then http, then ws.
    pub fn rules(&self) -> Result<Vec<Rule>> {
        let tcp = self.tcp.iter().enumerate().map(|(i, rule)| {
            rule.to_rule()
                .with_context(|| format!("Invalid tcp rule #{}", i + 1))
        });
        let http = self.http.iter().enumerate().map(|(i, rule)| {
            rule.to_rule()
                .with_context(|| format!("Invalid http rule #{}", i + 1))
        });
        let ws = self.ws.iter().enumerate().map(|(i, rule)| {
            rule.to_rule()
                .with_context(|| format!("Invalid ws rule #{}", i + 1))
        });
        tcp.chain(http).chain(ws).collect()
    }
}

impl TcpRuleConfig {
    fn to_rule(&self) -> Result<Rule> {
        let target = self.target_address.parse()?;
        build_rule(RuleKind::Tcp, self.local_port, target, &self.source_address)
    }
}

impl HttpRuleConfig {
    fn to_rule(&self) -> Result<Rule> {
        let target = target_from_parts(&self.target_host, self.target_port)?;
        build_rule(RuleKind::Http, self.local_port, target, &self.source_address)
    }
}

impl WsRuleConfig {
    fn to_rule(&self) -> Result<Rule> {
        if self.ca_file.is_some() && !self.secure {
            bail!("ca_file requires secure = true");
        }
        let target = target_from_parts(&self.target_host, self.target_port)?;
        let mut rule = build_rule(
            RuleKind::WebSocket,
            self.local_port,
            target,
            &self.source_address,
        )?
        .with_secure(self.secure);
        rule.ca_file.clone_from(&self.ca_file);
        Ok(rule)
    }
}

fn target_from_parts(host: &str, port: u16) -> Result<Target> {
    let host = host.trim();
    if host.is_empty() {
        bail!("target_host must not be empty");
    }
    if port == 0 {
        bail!("target_port must not be 0");
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok(Target::new(host, port))
}

fn build_rule(kind: RuleKind, local_port: u16, target: Target, source: &str) -> Result<Rule> {
    if local_port == 0 {
        bail!("local_port must not be 0");
    }
    let rule = Rule::new(kind, local_port, target);
    let source = source.trim();
    if source.is_empty() {
        return Ok(rule);
    }
    let source: SourceAddress = source.parse()?;
    Ok(rule.with_source(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    const FULL_CONFIG: &str = r#"
        [listen]
        ip = "127.0.0.1"

        [[tcp]]
        local_port = 9000
        target_address = "127.0.0.1:9001"

        [[tcp]]
        local_port = 9002
        target_address = "db.internal:5432"
        source_address = "10.0.0.5"

        [[http]]
        local_port = 8080
        target_host = "127.0.0.1"
        target_port = 8081
        source_address = ""

        [[ws]]
        local_port = 8443
        target_host = "echo.example.com"
        target_port = 443
        secure = true
        ca_file = "upstream-ca.pem"
    "#;

    mod parsing {
        use super::*;

        #[test]
        fn builds_rules_in_section_order() {
            let config = assert_ok!(parse_config(FULL_CONFIG));
            assert_eq!(config.listen.ip, "127.0.0.1".parse::<IpAddr>().unwrap());

            let rules = assert_ok!(config.rules());
            let kinds: Vec<_> = rules.iter().map(|r| (r.kind, r.local_port)).collect();
            assert_eq!(
                kinds,
                [
                    (RuleKind::Tcp, 9000),
                    (RuleKind::Tcp, 9002),
                    (RuleKind::Http, 8080),
                    (RuleKind::WebSocket, 8443),
                ]
            );

            assert_eq!(rules[0].target, Target::new("127.0.0.1", 9001));
            assert_eq!(rules[0].source, None);
            assert_eq!(
                rules[1].source,
                Some("10.0.0.5".parse::<SourceAddress>().unwrap())
            );
            assert_eq!(rules[2].source, None);
            assert!(rules[3].secure);
            assert_eq!(rules[3].ca_file, Some(PathBuf::from("upstream-ca.pem")));
        }

        #[test]
        fn example_config_is_valid() {
            let config = assert_ok!(parse_config(include_str!("../config.example.toml")));
            let rules = assert_ok!(config.rules());
            assert_eq!(rules.len(), 5);
            assert!(rules.iter().any(|rule| rule.source.is_some()));
        }

        #[test]
        fn missing_sections_are_empty() {
            let config = assert_ok!(parse_config(""));
            assert_eq!(config.listen.ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            assert!(assert_ok!(config.rules()).is_empty());
        }

        #[test]
        fn rejects_wrongly_typed_fields() {
            assert_err!(parse_config(
                "[[http]]\nlocal_port = \"8080\"\ntarget_host = \"a\"\ntarget_port = 80\n"
            ));
            assert_err!(parse_config("[[tcp]]\nlocal_port = 70000\ntarget_address = \"a:1\"\n"));
        }
    }

    mod validation {
        use super::*;

        fn first_rule_error(content: &str) -> String {
            let config = parse_config(content).unwrap();
            format!("{:#}", config.rules().unwrap_err())
        }

        #[test]
        fn rejects_zero_local_port() {
            let err = first_rule_error("[[tcp]]\nlocal_port = 0\ntarget_address = \"a:1\"\n");
            assert!(err.contains("tcp rule #1"), "{err}");
            assert!(err.contains("local_port"), "{err}");
        }

        #[test]
        fn rejects_bad_target_address() {
            let err = first_rule_error("[[tcp]]\nlocal_port = 1\ntarget_address = \"nohost\"\n");
            assert!(err.contains("Missing port"), "{err}");
        }

        #[test]
        fn rejects_empty_target_host() {
            let err = first_rule_error(
                "[[http]]\nlocal_port = 1\ntarget_host = \" \"\ntarget_port = 80\n",
            );
            assert!(err.contains("http rule #1"), "{err}");
            assert!(err.contains("target_host"), "{err}");
        }

        #[test]
        fn rejects_bad_source_address() {
            let err = first_rule_error(
                "[[ws]]\nlocal_port = 1\ntarget_host = \"a\"\ntarget_port = 80\nsource_address = \"eth0\"\n",
            );
            assert!(err.contains("ws rule #1"), "{err}");
            assert!(err.contains("Invalid source address"), "{err}");
        }

        #[test]
        fn ca_file_requires_secure() {
            let err = first_rule_error(
                "[[ws]]\nlocal_port = 1\ntarget_host = \"a\"\ntarget_port = 80\nca_file = \"ca.pem\"\n",
            );
            assert!(err.contains("ca_file requires secure"), "{err}");
        }

        #[test]
        fn accepts_bracketed_ipv6_target_host() {
            let config = parse_config(
                "[[http]]\nlocal_port = 1\ntarget_host = \"[::1]\"\ntarget_port = 80\n",
            )
            .unwrap();
            let rules = config.rules().unwrap();
            assert_eq!(rules[0].target.to_string(), "[::1]:80");
        }
    }

    mod loading {
        use super::*;

        #[test]
        fn loads_from_disk() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(FULL_CONFIG.as_bytes()).unwrap();

            let config = assert_ok!(load_config(file.path()));
            assert_eq!(config.tcp.len(), 2);
            assert_eq!(config.ws.len(), 1);
        }

        #[test]
        fn missing_file_names_the_path() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("absent.toml");
            let err = load_config(&path).unwrap_err();
            assert!(format!("{err}").contains("absent.toml"));
        }

        #[test]
        fn invalid_toml_names_the_path() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(b"[[tcp]\n").unwrap();
            let err = load_config(file.path()).unwrap_err();
            assert!(format!("{err}").contains("valid TOML"));
        }
    }
}
