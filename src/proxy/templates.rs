// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Configuration template, `{{ section }}` placeholders filled from the model.

use super::model::{server_name, PemFile, ProxyConfig};
use crate::constants::proxy::MAIN_TEMPLATE;
use crate::converter::DEFAULT_HOST;
use crate::error::{ControllerError, Result};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;
use tracing::info;

const SECTIONS: &[&str] = &["global", "frontends", "backends"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder(String),
}

#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    segments: Vec<Segment>,
}

/// Values rendered in addition to the configuration model
pub struct RenderContext<'a> {
    pub config: &'a ProxyConfig,
    pub slots: &'a BTreeMap<String, usize>,
    pub admin_socket: &'a Path,
    pub crt_list: &'a Path,
}

impl Template {
    /// Load and validate `<dir>/haproxy.tmpl`
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MAIN_TEMPLATE);
        let content = fs::read_to_string(&path).map_err(|e| {
            ControllerError::TemplateError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let template = Self::parse(MAIN_TEMPLATE, &content)?;
        info!("Parsed template {}", path.display());
        Ok(template)
    }

    pub fn parse(name: &str, content: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = content;

        while let Some(start) = rest.find("{{") {
            let text = &rest[..start];
            if text.contains("}}") {
                return Err(unbalanced(name, content, rest));
            }
            if !text.is_empty() {
                segments.push(Segment::Text(text.to_string()));
            }
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(unbalanced(name, content, after));
            };
            let placeholder = after[..end].trim();
            if placeholder.contains("{{") {
                return Err(unbalanced(name, content, after));
            }
            if !SECTIONS.contains(&placeholder) {
                return Err(ControllerError::TemplateError(format!(
                    "{}: unknown placeholder '{}'",
                    name, placeholder
                )));
            }
            segments.push(Segment::Placeholder(placeholder.to_string()));
            rest = &after[end + 2..];
        }
        if rest.contains("}}") {
            return Err(unbalanced(name, content, rest));
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            segments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(section) => match section.as_str() {
                    "global" => render_global(&mut out, ctx),
                    "frontends" => render_frontends(&mut out, ctx),
                    _ => render_backends(&mut out, ctx),
                },
            }
        }
        out
    }
}

fn unbalanced(name: &str, content: &str, rest: &str) -> ControllerError {
    let offset = content.len() - rest.len();
    let line = content[..offset].matches('\n').count() + 1;
    ControllerError::TemplateError(format!("{}:{}: unbalanced braces", name, line))
}

fn render_global(out: &mut String, ctx: &RenderContext<'_>) {
    let _ = writeln!(
        out,
        "    stats socket {} level admin expose-fd listeners",
        ctx.admin_socket.display()
    );
    let _ = writeln!(out, "    stats timeout 2m");
}

fn render_frontends(out: &mut String, ctx: &RenderContext<'_>) {
    let _ = writeln!(out, "frontend http");
    let _ = writeln!(out, "    bind :80");
    render_routes(out, ctx.config);

    let _ = writeln!(out);
    let _ = writeln!(out, "frontend https");
    let _ = writeln!(out, "    bind :443 ssl crt-list {}", ctx.crt_list.display());
    render_routes(out, ctx.config);
}

fn render_routes(out: &mut String, config: &ProxyConfig) {
    for host in config.hosts.values().filter(|h| h.hostname != DEFAULT_HOST) {
        for path in &host.paths {
            let _ = writeln!(
                out,
                "    use_backend {} if {{ hdr(host) -i {} }} {{ path_beg {} }}",
                path.backend, host.hostname, path.path
            );
        }
    }
    // rules without a host match any host, after the named hosts
    if let Some(host) = config.hosts.get(DEFAULT_HOST) {
        for path in &host.paths {
            let _ = writeln!(
                out,
                "    use_backend {} if {{ path_beg {} }}",
                path.backend, path.path
            );
        }
    }
    if let Some(default_backend) = &config.default_backend {
        let _ = writeln!(out, "    default_backend {}", default_backend);
    }
}

fn render_backends(out: &mut String, ctx: &RenderContext<'_>) {
    for backend in ctx.config.backends.values() {
        let slots = ctx.slots.get(&backend.name).copied().unwrap_or(0);
        let _ = writeln!(out, "backend {}", backend.name);
        for slot in 0..slots {
            match backend.endpoints.get(slot) {
                Some(ep) => {
                    let _ = writeln!(
                        out,
                        "    server {} {}:{} weight {}",
                        server_name(slot),
                        ep.ip,
                        ep.port,
                        ep.weight
                    );
                }
                None => {
                    let _ = writeln!(out, "    server {} 127.0.0.1:1 disabled", server_name(slot));
                }
            }
        }
        let _ = writeln!(out);
    }
}

/// crt-list content: one line per TLS host, the default certificate first
pub fn render_crt_list(config: &ProxyConfig) -> String {
    let mut out = String::new();
    if let Some(default_crt) = &config.default_crt {
        let _ = writeln!(out, "{}", default_crt.path.display());
    }
    for host in config.hosts.values().filter(|h| h.hostname != DEFAULT_HOST) {
        let crt: Option<&PemFile> = host.crt_file.as_ref().or(config.default_crt.as_ref());
        let Some(crt) = crt else {
            continue;
        };
        if host.crt_file.is_none() && host.ca_file.is_none() {
            continue;
        }
        match &host.ca_file {
            Some(ca) => {
                let _ = writeln!(
                    out,
                    "{} [ca-file {} verify required] {}",
                    crt.path.display(),
                    ca.path.display(),
                    host.hostname
                );
            }
            None => {
                let _ = writeln!(out, "{} {}", crt.path.display(), host.hostname);
            }
        }
    }
    out
}
