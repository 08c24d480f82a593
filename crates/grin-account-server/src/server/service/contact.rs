use super::store::UserQuery;

/// How a user can be reached; also the key an account is looked up by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Contact {
    /// Mainland mobile number: 11 digits starting with `1`.
    Phone(String),
    Email(String),
}

impl Contact {
    pub fn parse(raw: &str) -> Option<Self> {
        if is_phone_number(raw) {
            Some(Self::Phone(raw.to_string()))
        } else if is_email(raw) {
            Some(Self::Email(raw.to_string()))
        } else {
            None
        }
    }

    pub fn query(&self) -> UserQuery {
        match self {
            Self::Phone(p) => UserQuery::PhoneNumber(p.clone()),
            Self::Email(e) => UserQuery::Email(e.clone()),
        }
    }
}

fn is_phone_number(raw: &str) -> bool {
    raw.len() == 11 && raw.starts_with('1') && raw.bytes().all(|b| b.is_ascii_digit())
}

fn is_email(raw: &str) -> bool {
    let Some((local, domain)) = raw.split_once('@') else {
        return false;
    };
    let valid_chars = |s: &str| {
        s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'+' | b'%'))
    };

    !local.is_empty()
        && valid_chars(local)
        && valid_chars(domain)
        && !domain.contains('+')
        && domain
            .split_once('.')
            .is_some_and(|(head, _)| !head.is_empty())
        && domain
            .rsplit('.')
            .next()
            .is_some_and(|tld| tld.len() >= 2 && tld.bytes().all(|b| b.is_ascii_alphabetic()))
}
