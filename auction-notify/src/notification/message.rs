//! Rendering of match notifications.
//!
//! A [`NotificationMessage`] is built once per `(rule, listing)` match. Its
//! plain-text form is what the ledger stores; transports pick the form they
//! need (HTML for Telegram, embed fields for Discord).

use serde::{Deserialize, Serialize};

use crate::database::models::NotificationRuleDbModel;
use crate::domain::Listing;

/// A rendered match notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub title: String,
    /// `(label, value)` detail lines, in display order.
    pub fields: Vec<(String, String)>,
    pub thumbnail: Option<String>,
}

impl NotificationMessage {
    /// Message for `listing` matching `rule`.
    pub fn for_match(rule: &NotificationRuleDbModel, listing: &Listing) -> Self {
        let title = format!("[{}] 새 경매 매물", rule.name);

        let mut fields = Vec::new();
        let mut push = |label: &str, value: String| fields.push((label.to_string(), value));

        if let Some(address) = &listing.address {
            push("주소", address.clone());
        }
        if let Some(building) = &listing.building_name {
            push("건물명", building.clone());
        }
        if let Some(category) = &listing.category {
            push("용도", category.clone());
        }
        if let Some(area) = listing.area {
            push("면적", format!("{area:.2}㎡"));
        }
        push("최저가", format_price(listing.minimum_price));
        push("감정가", format_price(listing.estimated_price));
        if let Some(count) = listing.failed_auction_count.filter(|c| *c > 0) {
            push("유찰", format!("{count}회"));
        }
        if let Some(date) = listing.auction_date {
            push("매각기일", date.format("%Y-%m-%d").to_string());
        }
        if let Some(status) = &listing.status {
            push("상태", status.clone());
        }
        push("매물번호", listing.id.clone());

        Self {
            title,
            fields,
            thumbnail: listing.thumbnail.clone(),
        }
    }

    /// Plain text, one field per line.
    pub fn to_plain_text(&self) -> String {
        let mut text = self.title.clone();
        for (label, value) in &self.fields {
            text.push('\n');
            text.push_str(label);
            text.push_str(": ");
            text.push_str(value);
        }
        text
    }

    /// Telegram HTML: bold title, escaped values.
    pub fn to_html(&self) -> String {
        let mut text = format!("🔔 <b>{}</b>\n", escape_html(&self.title));
        for (label, value) in &self.fields {
            text.push('\n');
            text.push_str(&format!("<b>{}</b>: {}", escape_html(label), escape_html(value)));
        }
        text
    }
}

/// Korean price notation: `4억 5000만원`, `4억`, `3500만원`.
///
/// Amounts below 10,000 fall back to digit grouping.
pub fn format_price(price: Option<i64>) -> String {
    let Some(price) = price.filter(|p| *p > 0) else {
        return "가격 정보 없음".to_string();
    };

    let eok = price / 100_000_000;
    let man = (price % 100_000_000) / 10_000;

    match (eok, man) {
        (0, 0) => format!("{}원", group_digits(price)),
        (0, man) => format!("{}만원", group_digits(man)),
        (eok, 0) => format!("{}억", group_digits(eok)),
        (eok, man) => format!("{}억 {}만원", group_digits(eok), man),
    }
}

fn group_digits(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if n < 0 {
        out.insert(0, '-');
    }
    out
}

pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
