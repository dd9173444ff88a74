use serde::{Deserialize, Serialize};

/// SMTP envelope of a message.
///
/// An empty sender is the null reverse-path (`MAIL FROM:<>`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    sender: String,
    recipients: Vec<String>,
}

impl Envelope {
    #[must_use]
    pub const fn new(sender: String, recipients: Vec<String>) -> Self {
        Self { sender, recipients }
    }

    /// Returns the sender for this message
    #[inline]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Returns the recipients for this message
    #[inline]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn set_sender(&mut self, sender: String) {
        self.sender = sender;
    }

    pub fn add_recipient(&mut self, recipient: String) {
        self.recipients.push(recipient);
    }

    /// The domain every recipient shares, if they share exactly one.
    #[must_use]
    pub fn domain(&self) -> Option<String> {
        let mut domains = self.recipients.iter().filter_map(|r| domain_of(r));
        let first = domains.next()?.to_ascii_lowercase();

        domains
            .all(|d| d.eq_ignore_ascii_case(&first))
            .then_some(first)
    }

    /// Split into one envelope per recipient domain, keeping first-seen order.
    ///
    /// Recipients without a domain part are grouped under the empty domain.
    #[must_use]
    pub fn split_by_domain(&self) -> Vec<Self> {
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();

        for recipient in &self.recipients {
            let domain = domain_of(recipient).unwrap_or_default().to_ascii_lowercase();

            match groups.iter_mut().find(|(d, _)| *d == domain) {
                Some((_, list)) => list.push(recipient.clone()),
                None => groups.push((domain, vec![recipient.clone()])),
            }
        }

        groups
            .into_iter()
            .map(|(_, recipients)| Self::new(self.sender.clone(), recipients))
            .collect()
    }
}

/// The domain part of a mailbox, without surrounding whitespace.
#[must_use]
pub fn domain_of(mailbox: &str) -> Option<&str> {
    mailbox
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim())
        .filter(|domain| !domain.is_empty())
}

/// Minimal mailbox syntax check used for `MAIL FROM` / `RCPT TO` arguments.
#[must_use]
pub fn is_valid_mailbox(mailbox: &str) -> bool {
    let Some((local, domain)) = mailbox.rsplit_once('@') else {
        return false;
    };

    !local.is_empty()
        && !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !mailbox
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '<' | '>'))
}
