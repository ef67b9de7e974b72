//! Domain name helpers

/// Registrable base domain: the last two labels
///
/// `azure-prod.jambonz.io` gives `jambonz.io`. Names with fewer than two labels
/// are returned unchanged.
#[must_use]
pub fn extract_base_domain(name: &str) -> String {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() >= 2 {
        labels[labels.len() - 2..].join(".")
    } else {
        name.to_string()
    }
}

/// Subdomain part: every label before the base domain
///
/// `azure-prod.jambonz.io` gives `azure-prod`, `a.b.example.com` gives `a.b`.
/// With fewer than three labels the first label is returned.
#[must_use]
pub fn extract_subdomain(name: &str) -> String {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() >= 3 {
        labels[..labels.len() - 2].join(".")
    } else {
        labels[0].to_string()
    }
}
