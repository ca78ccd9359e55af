use crate::shell::{quote, Shell};

const TAG: &str = "kern-tuner";

/// Posts a system notification as the shell user (uid 2000), which is the
/// only identity `cmd notification post` accepts from a root process.
pub fn notification_command(message: &str) -> String {
    let inner = format!(
        "cmd notification post -S bigtext -t {title} {tag} {msg} >/dev/null 2>&1",
        title = quote("Kernel Tuner"),
        tag = quote(TAG),
        msg = quote(message),
    );
    format!("su -lp 2000 -c {}", quote(&inner))
}

/// Best effort; failures are only logged.
pub fn post_notification(shell: &dyn Shell, message: &str) {
    if let Err(e) = shell.exec(&notification_command(message)) {
        tracing::debug!("NOTIFY: post failed: {}", e);
    }
}
