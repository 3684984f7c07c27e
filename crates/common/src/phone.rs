//! Phone number and WhatsApp JID helpers.

/// Server part of a personal WhatsApp JID.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Keep only digits and rewrite a national `0` prefix to `country_code`.
///
/// `"0812-3456"` with `"62"` becomes `"628123456"`.
#[must_use]
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.strip_prefix('0') {
        Some(rest) => format!("{country_code}{rest}"),
        None => digits,
    }
}

/// Turn a bare number into a personal JID. Values that already carry a
/// server part are returned unchanged.
#[must_use]
pub fn to_jid(address: &str) -> String {
    if address.contains('@') {
        address.to_string()
    } else {
        format!("{address}@{USER_SERVER}")
    }
}

/// User part of a JID with any `:device` suffix removed.
#[must_use]
pub fn jid_user(jid: &str) -> &str {
    let user = jid.split_once('@').map_or(jid, |(user, _)| user);
    user.split_once(':').map_or(user, |(user, _)| user)
}

#[must_use]
pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with("@g.us")
}

/// Status updates and broadcast lists.
#[must_use]
pub fn is_broadcast_jid(jid: &str) -> bool {
    jid.ends_with("@broadcast")
}
