use nous_sync::sync::SyncNotification;

/// ANSI color codes
pub struct Color;

impl Color {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
}

fn paint(text: &str, color: &str, use_color: bool) -> String {
    if use_color {
        format!("{}{}{}", color, text, Color::RESET)
    } else {
        text.to_string()
    }
}

/// One line describing an engine notification
pub fn render_notification(notification: &SyncNotification, use_color: bool) -> String {
    match notification {
        SyncNotification::ReceivedOwnAccountDirtyObjects => {
            paint("Collected dirty objects of the owning account", Color::DIM, use_color)
        }
        SyncNotification::ReceivedAllDirtyObjects => {
            paint("Collected all dirty objects", Color::DIM, use_color)
        }
        SyncNotification::RequestLinkedAccountTokens { accounts } => {
            let guids: Vec<&str> = accounts.iter().map(|a| a.guid.as_str()).collect();
            format!("Tokens requested for linked accounts: {}", guids.join(", "))
        }
        SyncNotification::RequestOwningAccountAuthorization => paint(
            "Owning account authorization expired",
            Color::YELLOW,
            use_color,
        ),
        SyncNotification::RateLimitExceeded { seconds } => paint(
            &format!("Rate limit reached, waiting {}s", seconds),
            Color::YELLOW,
            use_color,
        ),
        SyncNotification::ConflictDetected => paint(
            "Conflict with the service, run an inbound sync first",
            Color::YELLOW,
            use_color,
        ),
        SyncNotification::MustRepeatInboundSync => paint(
            "Local copy drifted from the service, inbound sync must be repeated",
            Color::YELLOW,
            use_color,
        ),
        SyncNotification::Paused {
            pending_authorization,
        } => {
            if *pending_authorization {
                "Paused until the owning account is reauthorized".to_string()
            } else {
                "Paused".to_string()
            }
        }
        SyncNotification::Stopped => "Stopped".to_string(),
        SyncNotification::Finished { cursor } => paint(
            &format!("Finished, last update count {}", cursor),
            &format!("{}{}", Color::BOLD, Color::GREEN),
            use_color,
        ),
        SyncNotification::Failure { message, cursor } => paint(
            &format!("Failed at update count {}: {}", cursor, message),
            Color::RED,
            use_color,
        ),
    }
}
