use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::blocking::Client;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("playerfouls/", env!("CARGO_PKG_VERSION"));

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared blocking client. The timeout of the first caller sticks for the process.
pub fn http_client(timeout: Duration) -> Result<&'static Client, reqwest::Error> {
    CLIENT.get_or_try_init(|| Client::builder().timeout(timeout).user_agent(USER_AGENT).build())
}
