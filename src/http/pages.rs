//! Static HTML: the index page and the configuration view.

use crate::config::Config;
use crate::mount::Selection;
use crate::yuv;

pub const INDEX_HTML: &str = r#"<!doctype html>
<meta charset="utf-8" />
<title>crabcast</title>
<style>body{font-family:system-ui;margin:2rem} a{color:#0366d6;text-decoration:none} a:hover{text-decoration:underline}</style>
<h1>crabcast</h1>
<p>This server exposes a WHEP endpoint for receiving offers and returning answers. No player is embedded on this page.</p>
<ul>
  <li><a href="/config">/config</a> &mdash; configuration and runtime info</li>
  <li><a href="/health">/health</a> &mdash; health/metrics (JSON)</li>
  <li><code>POST /whep</code> &mdash; WHEP endpoint (send SDP offer)</li>
  <li><code>POST /whep/ndi/{key}</code> &mdash; WHEP endpoint for one source</li>
  <li><code>GET /frame</code> &mdash; latest frame as PNG (when available)</li>
  <li><code>GET /ndi/sources</code> &mdash; list NDI sources</li>
  <li><code>POST /ndi/select</code> &mdash; select NDI by name substring</li>
  <li><code>POST /ndi/select_url</code> &mdash; select NDI by URL</li>
</ul>
"#;

struct Row {
    name: &'static str,
    flag: &'static str,
    env: &'static str,
    value: String,
    default: &'static str,
    desc: &'static str,
}

fn getenv(key: &str) -> String {
    std::env::var(key).unwrap_or_default().trim().to_string()
}

/// Render the configuration page: flags/env, environment-only knobs, and
/// runtime selections.
pub fn config_html(cfg: &Config, selection: &Selection) -> String {
    let rows = vec![
        Row {
            name: "Host",
            flag: "--host",
            env: "HOST",
            value: cfg.host.clone(),
            default: "0.0.0.0",
            desc: "HTTP bind host",
        },
        Row {
            name: "Port",
            flag: "--port",
            env: "PORT",
            value: cfg.port.to_string(),
            default: "8000",
            desc: "HTTP bind port",
        },
        Row {
            name: "FPS",
            flag: "--fps",
            env: "FPS",
            value: cfg.fps.to_string(),
            default: "30",
            desc: "Encoder frame rate",
        },
        Row {
            name: "Width",
            flag: "--width",
            env: "VIDEO_WIDTH",
            value: cfg.width.to_string(),
            default: "1280",
            desc: "Video width (synthetic/initial)",
        },
        Row {
            name: "Height",
            flag: "--height",
            env: "VIDEO_HEIGHT",
            value: cfg.height.to_string(),
            default: "720",
            desc: "Video height (synthetic/initial)",
        },
        Row {
            name: "Bitrate",
            flag: "--bitrate-kbps",
            env: "VIDEO_BITRATE_KBPS",
            value: cfg.bitrate_kbps.to_string(),
            default: "6000",
            desc: "Target video bitrate (kbps)",
        },
        Row {
            name: "Codec",
            flag: "--codec",
            env: "VIDEO_CODEC",
            value: cfg.codec.clone(),
            default: "vp8",
            desc: "Video codec: vp8, vp9, av1",
        },
        Row {
            name: "VP8 Speed",
            flag: "--vp8-speed",
            env: "VIDEO_VP8_SPEED",
            value: cfg.vp8_speed.to_string(),
            default: "8",
            desc: "VP8 cpu_used speed (0=best, 8=fastest)",
        },
        Row {
            name: "VP8 Dropframe",
            flag: "--vp8-dropframe",
            env: "VIDEO_VP8_DROPFRAME",
            value: cfg.vp8_dropframe.to_string(),
            default: "25",
            desc: "VP8 drop-frame threshold (0=off)",
        },
        Row {
            name: "Scale Filter",
            flag: "--scale-filter",
            env: "YUV_SCALE_FILTER",
            value: getenv("YUV_SCALE_FILTER"),
            default: "BOX",
            desc: "Rescale filter: NONE, LINEAR, BILINEAR, BOX",
        },
        Row {
            name: "NDI Color",
            flag: "--color",
            env: "NDI_RECV_COLOR",
            value: getenv("NDI_RECV_COLOR"),
            default: "",
            desc: "NDI receive colour: bgra or uyvy",
        },
        Row {
            name: "Select Applies Live",
            flag: "--select-applies-live",
            env: "NDI_SELECT_APPLIES_LIVE",
            value: cfg.select_applies_live.to_string(),
            default: "true",
            desc: "Whether /ndi/select retargets the live shared pipeline",
        },
    ];

    let env_only = vec![
        Row {
            name: "NDI Source Name",
            flag: "(n/a)",
            env: "NDI_SOURCE",
            value: getenv("NDI_SOURCE"),
            default: "",
            desc: "Preferred NDI source display name",
        },
        Row {
            name: "NDI Source URL",
            flag: "(n/a)",
            env: "NDI_SOURCE_URL",
            value: getenv("NDI_SOURCE_URL"),
            default: "",
            desc: "Preferred NDI source URL (ndi://...)",
        },
        Row {
            name: "NDI Groups",
            flag: "(n/a)",
            env: "NDI_GROUPS",
            value: getenv("NDI_GROUPS"),
            default: "",
            desc: "Comma-separated NDI groups for discovery",
        },
        Row {
            name: "NDI Extra IPs",
            flag: "(n/a)",
            env: "NDI_EXTRA_IPS",
            value: getenv("NDI_EXTRA_IPS"),
            default: "",
            desc: "Comma-separated unicast IPs for discovery",
        },
        Row {
            name: "Packed Byte Order",
            flag: "(n/a)",
            env: "YUV_BGRA_ORDER",
            value: getenv("YUV_BGRA_ORDER"),
            default: "BGRA",
            desc: "Packed pixel byte order for converters",
        },
        Row {
            name: "Swap UV",
            flag: "(n/a)",
            env: "YUV_SWAP_UV",
            value: getenv("YUV_SWAP_UV"),
            default: "",
            desc: "Swap U/V planes in converters (1/true)",
        },
    ];

    let runtime = vec![
        Row {
            name: "Selected NDI Name",
            flag: "(runtime)",
            env: "(runtime)",
            value: selection.name.clone(),
            default: "",
            desc: "Current selected source name",
        },
        Row {
            name: "Selected NDI URL",
            flag: "(runtime)",
            env: "(runtime)",
            value: selection.url.clone(),
            default: "",
            desc: "Current selected source URL",
        },
        Row {
            name: "Color Conversion",
            flag: "(build)",
            env: "(build)",
            value: yuv::conversion_impl(),
            default: "",
            desc: "simd or scalar kernels",
        },
    ];

    let mut out = String::new();
    out.push_str("<!doctype html><meta charset=\"utf-8\"><title>crabcast config</title>");
    out.push_str(
        "<style>body{font-family:system-ui;margin:2rem} table{border-collapse:collapse} \
         th,td{border:1px solid #ddd;padding:.4rem .6rem} th{background:#f5f5f5;text-align:left} \
         code{background:#f6f8fa;padding:.1rem .25rem;border-radius:3px}</style>",
    );
    out.push_str("<h1>crabcast configuration</h1>");
    out.push_str(&format!(
        "<p>Listening on <code>{}:{}</code>. This page lists command-line flags and environment variables that control the server.</p>",
        html_escape(&cfg.host),
        cfg.port
    ));
    push_table(&mut out, "Flags + Env", &rows);
    push_table(&mut out, "Environment Only", &env_only);
    push_table(&mut out, "Runtime Info", &runtime);
    out
}

fn push_table(out: &mut String, title: &str, rows: &[Row]) {
    out.push_str(&format!("<h2>{}</h2>", html_escape(title)));
    out.push_str("<table><tr><th>Name</th><th>Flag</th><th>Env</th><th>Value</th><th>Default</th><th>Description</th></tr>");
    for row in rows {
        out.push_str(&format!(
            "<tr><td>{}</td><td><code>{}</code></td><td><code>{}</code></td><td><code>{}</code></td><td><code>{}</code></td><td>{}</td></tr>",
            html_escape(row.name),
            html_escape(row.flag),
            html_escape(row.env),
            html_escape(&row.value),
            html_escape(row.default),
            html_escape(row.desc)
        ));
    }
    out.push_str("</table>");
}

/// Minimal escaping for text nodes.
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("a<b>&c"), "a&lt;b&gt;&amp;c");
    }

    #[test]
    fn test_index_mentions_endpoints() {
        assert!(INDEX_HTML.contains("/whep"));
        assert!(INDEX_HTML.contains("/health"));
        assert!(INDEX_HTML.contains("/ndi/sources"));
    }
}
