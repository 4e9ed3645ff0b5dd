//! User-Friendly Error Formatting
//!
//! Turns startup and host-loop failures into messages with troubleshooting
//! hints for the common cases.

use std::fmt::Write;

/// Format error for user consumption
///
/// Takes technical error and produces user-friendly message with
/// troubleshooting steps and context.
pub fn format_user_error(error: &anyhow::Error) -> String {
    let mut output = String::new();

    writeln!(&mut output).ok();
    writeln!(
        &mut output,
        "╔════════════════════════════════════════════════════════════╗"
    )
    .ok();
    writeln!(
        &mut output,
        "║                     ERROR                                  ║"
    )
    .ok();
    writeln!(
        &mut output,
        "╚════════════════════════════════════════════════════════════╝"
    )
    .ok();
    writeln!(&mut output).ok();

    // Match against the whole context chain, not just the outermost message
    let error_msg = format!("{:#}", error);
    let lower = error_msg.to_lowercase();

    if lower.contains("engine") || lower.contains("openvpn") || lower.contains("spawn") {
        format_engine_error(&mut output);
    } else if lower.contains("store") || lower.contains("state file") {
        format_store_error(&mut output);
    } else if lower.contains("config") {
        format_config_error(&mut output);
    } else {
        format_generic_error(&mut output, &error_msg);
    }

    writeln!(&mut output).ok();
    writeln!(
        &mut output,
        "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━"
    )
    .ok();
    writeln!(&mut output, "Technical Details:").ok();
    writeln!(&mut output).ok();
    writeln!(&mut output, "{:#}", error).ok();
    writeln!(&mut output).ok();

    writeln!(
        &mut output,
        "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━"
    )
    .ok();
    writeln!(&mut output, "Need Help?").ok();
    writeln!(
        &mut output,
        "  - Run with --verbose for detailed logs: lamco-vpn-session -vv"
    )
    .ok();
    writeln!(
        &mut output,
        "  - Report issues: https://github.com/lamco-admin/lamco-vpn-session/issues"
    )
    .ok();
    writeln!(
        &mut output,
        "╚════════════════════════════════════════════════════════════╝"
    )
    .ok();

    output
}

fn format_engine_error(output: &mut String) {
    writeln!(output, "VPN Engine Error").ok();
    writeln!(output).ok();
    writeln!(output, "Could not start or control the tunnel engine.").ok();
    writeln!(output).ok();
    writeln!(output, "Common Causes:").ok();
    writeln!(output).ok();
    writeln!(output, "  1. OpenVPN is not installed").ok();
    writeln!(output, "     → Check: openvpn --version").ok();
    writeln!(output, "     → Install: sudo apt install openvpn").ok();
    writeln!(output).ok();
    writeln!(output, "  2. Engine binary path is wrong").ok();
    writeln!(output, "     → Set [engine] binary in config.toml").ok();
    writeln!(output, "     → Or pass --engine-binary /path/to/openvpn").ok();
    writeln!(output).ok();
    writeln!(output, "  3. Missing privileges for the tun device").ok();
    writeln!(output, "     → Grant CAP_NET_ADMIN to the engine binary").ok();
    writeln!(
        output,
        "       sudo setcap cap_net_admin+ep $(which openvpn)"
    )
    .ok();
}

fn format_store_error(output: &mut String) {
    writeln!(output, "State Store Error").ok();
    writeln!(output).ok();
    writeln!(output, "Could not read or write the session state file.").ok();
    writeln!(output).ok();
    writeln!(output, "Common Causes:").ok();
    writeln!(output).ok();
    writeln!(output, "  1. Directory not writable").ok();
    writeln!(output, "     → Check permissions on ~/.local/share/lamco-vpn-session").ok();
    writeln!(output, "     → Or pass --store /writable/path/state.json").ok();
    writeln!(output).ok();
    writeln!(output, "  2. Disk full").ok();
    writeln!(output, "     → Check: df -h").ok();
}

fn format_config_error(output: &mut String) {
    writeln!(output, "Configuration Error").ok();
    writeln!(output).ok();
    writeln!(output, "Problem with configuration file.").ok();
    writeln!(output).ok();
    writeln!(output, "Common Causes:").ok();
    writeln!(output).ok();
    writeln!(output, "  1. Configuration file not found").ok();
    writeln!(
        output,
        "     → Or specify: lamco-vpn-session -c /path/to/config.toml"
    )
    .ok();
    writeln!(output).ok();
    writeln!(output, "  2. Invalid TOML syntax").ok();
    writeln!(output, "     → Check for typos, missing quotes, etc.").ok();
    writeln!(output).ok();
    writeln!(output, "  3. Invalid values").ok();
    writeln!(output, "     → [timer] check_interval_ms must be > 0").ok();
    writeln!(
        output,
        "     → [permission] mode must be \"prompt\" or \"granted\""
    )
    .ok();
}

fn format_generic_error(output: &mut String, error: &str) {
    writeln!(output, "Session Host Error").ok();
    writeln!(output).ok();
    writeln!(output, "An error occurred while running the session host.").ok();
    writeln!(output).ok();
    writeln!(output, "Error: {}", error).ok();
    writeln!(output).ok();
    writeln!(output, "Troubleshooting:").ok();
    writeln!(output).ok();
    writeln!(output, "  1. Re-run with -vv and check the log output").ok();
    writeln!(output, "  2. Verify the control input is one JSON object per line").ok();
}
