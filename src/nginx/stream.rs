//! The stream configuration model and its text rendering.
//!
//! Rendering is a pure function of the model; the driver only decides
//! where the bytes go.

use std::fmt;

use crate::annotations::Method;

/// One per-service configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct StreamConfig {
    pub resolver: Option<String>,
    pub upstreams: Vec<StreamUpstream>,
    pub servers: Vec<StreamServer>,
}

/// Balancing directive of an upstream. Round-robin is the proxy's default
/// and must not be emitted, so it has no variant here.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum LoadBalance {
    LeastConn,
    LeastTime(Method),
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct StreamUpstream {
    pub name: String,
    pub load_balance: Option<LoadBalance>,
    pub servers: Vec<StreamUpstreamServer>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct StreamUpstreamServer {
    /// `host:port`, as required by the upstream server directive.
    pub address: String,
    pub weight: Option<u32>,
    pub max_conns: Option<u32>,
    pub max_fails: Option<u32>,
    pub fail_timeout: Option<String>,
    pub backup: bool,
    pub down: bool,
}

impl StreamUpstreamServer {
    pub fn new(address: String) -> Self {
        Self {
            address,
            weight: None,
            max_conns: None,
            max_fails: None,
            fail_timeout: None,
            backup: false,
            down: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct StreamListen {
    pub address: Option<String>,
    pub port: i32,
    pub udp: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct StreamServer {
    pub listen: StreamListen,
    pub proxy_protocol: bool,
    pub pass_through: bool,
    pub upstream: String,
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut separate = false;

        if let Some(resolver) = &self.resolver {
            writeln!(f, "resolver {resolver};")?;
            separate = true;
        }
        for upstream in &self.upstreams {
            if separate {
                writeln!(f)?;
            }
            write!(f, "{upstream}")?;
            separate = true;
        }
        for server in &self.servers {
            if separate {
                writeln!(f)?;
            }
            write!(f, "{server}")?;
            separate = true;
        }
        Ok(())
    }
}

impl fmt::Display for StreamUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "upstream {} {{", self.name)?;
        match &self.load_balance {
            None => {}
            Some(LoadBalance::LeastConn) => writeln!(f, "    least_conn;")?,
            Some(LoadBalance::LeastTime(method)) => {
                writeln!(f, "    least_time {};", method.directive())?
            }
        }
        for server in &self.servers {
            write!(f, "    server {}", server.address)?;
            if let Some(weight) = server.weight {
                write!(f, " weight={weight}")?;
            }
            if let Some(max_conns) = server.max_conns {
                write!(f, " max_conns={max_conns}")?;
            }
            if let Some(max_fails) = server.max_fails {
                write!(f, " max_fails={max_fails}")?;
            }
            if let Some(fail_timeout) = &server.fail_timeout {
                write!(f, " fail_timeout={fail_timeout}")?;
            }
            if server.backup {
                write!(f, " backup")?;
            }
            if server.down {
                write!(f, " down")?;
            }
            writeln!(f, ";")?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for StreamServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "server {{")?;

        write!(f, "    listen ")?;
        match &self.listen.address {
            Some(address) => write!(f, "{address}:{}", self.listen.port)?,
            None => write!(f, "{}", self.listen.port)?,
        }
        if self.listen.udp {
            write!(f, " udp")?;
        }
        if self.proxy_protocol {
            write!(f, " proxy_protocol")?;
        }
        writeln!(f, ";")?;

        if self.pass_through {
            writeln!(f, "    proxy_bind $remote_addr transparent;")?;
        }
        writeln!(f, "    proxy_pass {};", self.upstream)?;
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_basic_udp() {
        let config = StreamConfig {
            resolver: None,
            upstreams: vec![StreamUpstream {
                name: "ns1-svc1-ntp".into(),
                load_balance: None,
                servers: vec![StreamUpstreamServer::new("10.0.0.11:30123".into())],
            }],
            servers: vec![StreamServer {
                listen: StreamListen {
                    address: None,
                    port: 123,
                    udp: true,
                },
                proxy_protocol: false,
                pass_through: false,
                upstream: "ns1-svc1-ntp".into(),
            }],
        };

        assert_eq!(
            config.to_string(),
            "upstream ns1-svc1-ntp {
    server 10.0.0.11:30123;
}

server {
    listen 123 udp;
    proxy_pass ns1-svc1-ntp;
}
"
        );
    }

    #[test]
    fn test_render_least_time_with_method() {
        let config = StreamConfig {
            resolver: Some("10.96.0.10".into()),
            upstreams: vec![StreamUpstream {
                name: "ns3-svcC-unnamed".into(),
                load_balance: Some(LoadBalance::LeastTime(Method::FirstByte)),
                servers: vec![StreamUpstreamServer::new("10.1.1.7:9000".into())],
            }],
            servers: vec![StreamServer {
                listen: StreamListen {
                    address: None,
                    port: 9000,
                    udp: false,
                },
                proxy_protocol: false,
                pass_through: true,
                upstream: "ns3-svcC-unnamed".into(),
            }],
        };

        assert_eq!(
            config.to_string(),
            "resolver 10.96.0.10;

upstream ns3-svcC-unnamed {
    least_time first_byte;
    server 10.1.1.7:9000;
}

server {
    listen 9000;
    proxy_bind $remote_addr transparent;
    proxy_pass ns3-svcC-unnamed;
}
"
        );
    }

    #[test]
    fn test_render_server_parameters() {
        let upstream = StreamUpstream {
            name: "ns1-db-pg".into(),
            load_balance: Some(LoadBalance::LeastConn),
            servers: vec![
                StreamUpstreamServer {
                    weight: Some(2),
                    max_fails: Some(3),
                    fail_timeout: Some("30s".into()),
                    ..StreamUpstreamServer::new("10.1.1.4:5432".into())
                },
                StreamUpstreamServer {
                    backup: true,
                    ..StreamUpstreamServer::new("10.1.1.5:5432".into())
                },
            ],
        };

        assert_eq!(
            upstream.to_string(),
            "upstream ns1-db-pg {
    least_conn;
    server 10.1.1.4:5432 weight=2 max_fails=3 fail_timeout=30s;
    server 10.1.1.5:5432 backup;
}
"
        );
    }
}
