//! The top-level proxy configuration file.

use std::fmt::Write;
use std::path::Path;

/// Settings rendered into the main configuration file. The stream context
/// includes the per-service files; the http context exists only to answer
/// health checks.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct MainConfig {
    pub user: String,
    pub worker_processes: String,
    pub worker_connections: u32,
    pub error_log: String,
    pub error_log_level: String,
    pub pid_file: String,
    pub health_check: bool,
    pub health_port: u16,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            user: "nginx".into(),
            // should track the pod's cpu limit, not the host's cpu count,
            // so "auto" is intentionally not the default
            worker_processes: "2".into(),
            worker_connections: 1024,
            error_log: "/var/log/nginx/error.log".into(),
            error_log_level: "warn".into(),
            pid_file: "/var/run/nginx.pid".into(),
            health_check: true,
            health_port: 7331,
        }
    }
}

impl MainConfig {
    /// Renders the whole main file; `conf_d` is the directory the stream
    /// context includes per-service files from.
    pub fn render(&self, conf_d: &Path) -> String {
        let mut out = String::new();
        // infallible writes to a String
        let _ = self.render_to(&mut out, conf_d);
        out
    }

    fn render_to(&self, out: &mut String, conf_d: &Path) -> std::fmt::Result {
        writeln!(out, "# generated by lbex, do not edit")?;
        writeln!(out, "user {};", self.user)?;
        writeln!(out, "worker_processes {};", self.worker_processes)?;
        writeln!(out, "error_log {} {};", self.error_log, self.error_log_level)?;
        writeln!(out, "pid {};", self.pid_file)?;
        writeln!(out)?;
        writeln!(out, "events {{")?;
        writeln!(out, "    worker_connections {};", self.worker_connections)?;
        writeln!(out, "    multi_accept on;")?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        writeln!(out, "stream {{")?;
        writeln!(out, "    include {};", conf_d.join("*.stream.conf").display())?;
        writeln!(out, "}}")?;

        if self.health_check {
            writeln!(out)?;
            writeln!(out, "http {{")?;
            writeln!(out, "    server {{")?;
            writeln!(out, "        listen {};", self.health_port)?;
            writeln!(out)?;
            writeln!(out, "        location / {{")?;
            writeln!(out, "            return 200 'healthy';")?;
            writeln!(out, "        }}")?;
            writeln!(out, "    }}")?;
            writeln!(out, "}}")?;
        }
        Ok(())
    }
}
