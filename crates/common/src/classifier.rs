// SSH Tunnel Keeper - Output Classifier
// Decides whether a line of tunnel output means the tunnel must be reset

/// ssh output fragments that mean the tunnel is up but no longer usable
pub const RESET_SIGNATURES: &[&str] = &[
    "remote port forwarding failed",
    "client_loop: send disconnect: Broken pipe",
];

/// Returns true when the line contains one of the reset signatures (case-sensitive)
pub fn requires_reset(line: &str) -> bool {
    RESET_SIGNATURES
        .iter()
        .any(|signature| line.contains(signature))
}
