// Settings Page Module - server-rendered PEX configuration page
use crate::pex_config::{PexConfig, LIBRARY_MISSING_MSG};
use crate::types::{ChipType, StationRegistry};

pub const UPDATE_PATH: &str = "/pexu";
pub const SCAN_PATH: &str = "/pex_scan";
pub const HELP_PATH: &str = "/static/docs/plugins/pex-docs.html";

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>SIP - Port Extender Settings</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Ubuntu, sans-serif;
            background: #f4f4f4;
            color: #222;
            padding: 20px;
            line-height: 1.5;
        }
        .container { max-width: 820px; margin: 0 auto; }
        h1 { font-size: 1.6em; margin-bottom: 10px; }
        .section {
            background: #fff;
            border: 1px solid #ccc;
            border-radius: 6px;
            padding: 16px;
            margin-bottom: 16px;
        }
        .warning { color: #b00000; font-weight: 600; }
        .notice { color: #8a6d00; font-weight: 600; }
        table.devices { border-collapse: collapse; width: 100%; }
        table.devices th, table.devices td {
            border: 1px solid #ccc;
            padding: 4px 8px;
            text-align: left;
        }
        table.devices th { background: #e8e8e8; }
        .field { margin: 6px 0; }
        .field label { display: inline-block; min-width: 220px; }
        .controls { margin-top: 12px; display: flex; gap: 10px; }
    </style>
</head>
<body>
<div class="container">
"#;

const PAGE_TAIL: &str = "</div>\n</body>\n</html>\n";

/// Everything the settings page displays.
pub struct PageContext<'a> {
    pub config: &'a PexConfig,
    pub stations: &'a StationRegistry,
    pub bus_available: bool,
    pub supported: &'a [ChipType],
}

/// Escape text for use in HTML element content and quoted attribute values.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn checked(on: bool) -> &'static str {
    if on { " checked" } else { "" }
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

pub fn render_settings_page(ctx: &PageContext) -> String {
    let cfg = ctx.config;
    let mut html = String::from(PAGE_HEAD);

    html.push_str(&format!(
        "<h1>Port Extender Settings <a href=\"{}\" target=\"_blank\" rel=\"noopener\" class=\"help\">Help</a></h1>\n",
        HELP_PATH
    ));

    // Status banner
    let status_color = if cfg.pex_status.is_enabled() { "green" } else { "red" };
    html.push_str("<div class=\"section\" id=\"status\">\n");
    html.push_str(&format!(
        "<p>PEX status: <span id=\"pex-status\" style=\"color: {};\">{}</span></p>\n",
        status_color,
        escape_html(cfg.pex_status.as_str())
    ));
    html.push_str(&format!(
        "<p>Autoconfigure: <span id=\"pex-autoconfig\">{}</span></p>\n",
        on_off(cfg.auto_configure)
    ));
    html.push_str(&format!(
        "<p>Stations mapped: {} of {}</p>\n",
        cfg.num_pex_stations(),
        ctx.stations.len()
    ));
    html.push_str("</div>\n");

    // Capability and runtime warnings
    if !ctx.bus_available {
        html.push_str(&format!(
            "<p class=\"warning\" id=\"bus-warning\">{}</p>\n",
            LIBRARY_MISSING_MSG
        ));
    }
    if cfg.demo_mode {
        html.push_str(
            "<p class=\"notice\" id=\"demo-warning\">Demo mode is on: bus writes are only logged.</p>\n",
        );
    }
    if !cfg.warnmsg.is_empty() {
        html.push_str(&format!(
            "<p class=\"warning\" id=\"warnmsg\">{}</p>\n",
            escape_html(&cfg.warnmsg)
        ));
    }

    html.push_str(&render_device_table(ctx));
    html.push_str(&render_discovered(&cfg.discovered_devices));
    html.push_str(&render_form(ctx));
    html.push_str(PAGE_TAIL);
    html
}

fn render_device_table(ctx: &PageContext) -> String {
    let devices = &ctx.config.dev_configs;
    let mut html = String::from("<div class=\"section\" id=\"devices\">\n<h2>Configured Hardware</h2>\n");

    if devices.is_empty() {
        html.push_str("<p id=\"no-devices\">No Hardware Devices Configured</p>\n</div>\n");
        return html;
    }

    html.push_str(
        "<table class=\"devices\">\n<tr><th>#</th><th>Bus</th><th>Address</th><th>Chip</th><th>Stations</th></tr>\n",
    );
    for (i, dev) in devices.iter().enumerate() {
        html.push_str(&format!(
            "<tr class=\"device-row\"><td>{}</td><td>{}</td><td>0x{:02X}</td><td>{}</td><td>{}</td></tr>\n",
            i + 1,
            dev.bus_id,
            dev.hw_addr,
            dev.ic_type,
            escape_html(&ctx.stations.span_label(dev))
        ));
    }
    html.push_str("</table>\n</div>\n");
    html
}

fn render_discovered(found: &[u8]) -> String {
    if found.is_empty() {
        return String::new();
    }
    let addrs: Vec<String> = found.iter().map(|a| format!("0x{:02X}", a)).collect();
    format!(
        "<div class=\"section\" id=\"discovered\"><p>Devices found on the bus: {}</p></div>\n",
        addrs.join(", ")
    )
}

fn render_form(ctx: &PageContext) -> String {
    let cfg = ctx.config;
    let mut html = format!(
        "<div class=\"section\" id=\"settings\">\n<form method=\"post\" action=\"{}\">\n",
        UPDATE_PATH
    );

    html.push_str(&format!(
        "<div class=\"field\"><label for=\"enable_pex\">Enable port extender</label>\
         <input type=\"checkbox\" name=\"enable_pex\" id=\"enable_pex\"{}></div>\n",
        checked(cfg.pex_status.is_enabled())
    ));
    html.push_str(&format!(
        "<div class=\"field\"><label for=\"auto_configure\">Autoconfigure devices</label>\
         <input type=\"checkbox\" name=\"auto_configure\" id=\"auto_configure\"{}></div>\n",
        checked(cfg.auto_configure)
    ));

    html.push_str(
        "<div class=\"field\"><label for=\"auto_ic\">Default chip type</label>\n<select name=\"auto_ic\" id=\"auto_ic\">\n",
    );
    for chip in ctx.supported {
        let selected = if *chip == cfg.default_ic_type { " selected" } else { "" };
        html.push_str(&format!(
            "<option value=\"{}\"{}>{}</option>\n",
            chip, selected, chip
        ));
    }
    html.push_str("</select></div>\n");

    html.push_str(&format!(
        "<div class=\"field\"><label for=\"demo_mode\">Demo mode</label>\
         <input type=\"checkbox\" name=\"demo_mode\" id=\"demo_mode\"{}></div>\n",
        checked(cfg.demo_mode)
    ));

    html.push_str(&format!(
        "<div class=\"controls\"><button type=\"submit\">Submit</button>\
         <a href=\"{}\">Scan bus</a></div>\n</form>\n</div>\n",
        SCAN_PATH
    ));
    html
}
