use crate::models::EmailType;

/// IMAP folder holding a mailbox category.
pub fn folder_for(category: EmailType) -> &'static str {
    match category {
        EmailType::Inbox => "INBOX",
        EmailType::Sent => "Sent",
        EmailType::Draft => "Drafts",
        EmailType::Trash => "Junk",
        EmailType::Deleted => "Trash",
    }
}

/// Category for an IMAP folder name, if it is one of the mapped folders.
pub fn category_for_folder(folder: &str) -> Option<EmailType> {
    let folder = folder.trim();
    if folder.eq_ignore_ascii_case("INBOX") {
        return Some(EmailType::Inbox);
    }
    match folder {
        "Sent" => Some(EmailType::Sent),
        "Drafts" => Some(EmailType::Draft),
        "Junk" => Some(EmailType::Trash),
        "Trash" => Some(EmailType::Deleted),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folders_map_both_ways() {
        for category in EmailType::ALL {
            assert_eq!(category_for_folder(folder_for(category)), Some(category));
        }
        assert_eq!(category_for_folder("Inbox"), Some(EmailType::Inbox));
        assert_eq!(category_for_folder("Trash"), Some(EmailType::Deleted));
        assert_eq!(category_for_folder("Junk"), Some(EmailType::Trash));
        assert_eq!(category_for_folder("Archive"), None);
    }
}
