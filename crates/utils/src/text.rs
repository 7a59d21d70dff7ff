use uuid::Uuid;

const MAX_BRANCH_SLUG_LEN: usize = 24;

/// Turn an arbitrary title into something safe to embed in a git branch or
/// directory name: lowercase ascii alphanumerics separated by single dashes.
pub fn git_branch_id(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }

    let mut slug: String = slug.chars().take(MAX_BRANCH_SLUG_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

pub fn short_uuid(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
