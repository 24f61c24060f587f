//! HTML scraping for the login form, anti-forgery tokens, and page titles.
//!
//! Everything here takes the page body as `&str` and returns owned data, so
//! no parsed document outlives the call (and none is held across an
//! `.await`).

use scraper::{ElementRef, Html, Selector};

/// Input names the portal uses for its anti-forgery token.
const TOKEN_INPUT_NAMES: &[&str] = &["__RequestVerificationToken", "__RequestVerificationTokenWith"];

/// Marker searched for in hidden input names and ids as a last resort.
const TOKEN_MARKER: &str = "VerificationToken";

const USER_FIELD_CANDIDATES: &[&str] = &["UserName", "Email", "Login", "Username"];
const PASSWORD_FIELD_CANDIDATES: &[&str] = &["Password", "Pass", "Pwd"];

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|_| unreachable!())
}

/// Finds the anti-forgery token on a page.
///
/// Looks at, in order: inputs with a known token name, the
/// `__RequestVerificationToken` meta tag, then any hidden input whose name
/// or id contains `VerificationToken`. Empty values are ignored.
#[must_use]
pub fn find_csrf_token(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let input_sel = selector("input");

    for name in TOKEN_INPUT_NAMES {
        let found = doc
            .select(&input_sel)
            .filter(|el| el.value().attr("name") == Some(*name))
            .find_map(|el| non_empty(el.value().attr("value")));
        if found.is_some() {
            return found;
        }
    }

    let meta_sel = selector(r#"meta[name="__RequestVerificationToken"]"#);
    if let Some(token) = doc
        .select(&meta_sel)
        .find_map(|el| non_empty(el.value().attr("content")))
    {
        return Some(token);
    }

    let hidden_sel = selector(r#"input[type="hidden"]"#);
    doc.select(&hidden_sel)
        .filter(|el| {
            let name = el.value().attr("name").unwrap_or_default();
            let id = el.value().attr("id").unwrap_or_default();
            name.contains(TOKEN_MARKER) || id.contains(TOKEN_MARKER)
        })
        .find_map(|el| non_empty(el.value().attr("value")))
}

/// Trimmed text of the page's `<title>`, if present and non-empty.
#[must_use]
pub fn page_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let title_sel = selector("title");
    doc.select(&title_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_owned())
        .filter(|t| !t.is_empty())
}

/// The first `<form>` on the login page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginForm {
    /// The form's `action` attribute, if set and non-empty.
    pub action: Option<String>,
    /// Named inputs and their initial values, in document order.
    pub fields: Vec<(String, String)>,
    /// Names of `type="password"` inputs anywhere on the page.
    pub password_inputs: Vec<String>,
}

impl LoginForm {
    /// Parses the first form on `html`.
    #[must_use]
    pub fn parse(html: &str) -> Option<Self> {
        let doc = Html::parse_document(html);
        let form = doc.select(&selector("form")).next()?;

        let action = form
            .value()
            .attr("action")
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_owned);

        let mut parsed = Self {
            action,
            ..Self::default()
        };
        for input in form.select(&selector("input")) {
            if let Some((name, value)) = named_input(input) {
                parsed.set(&name, value);
            }
        }

        parsed.password_inputs = doc
            .select(&selector(r#"input[type="password"]"#))
            .filter_map(|el| non_empty(el.value().attr("name")))
            .collect();

        Some(parsed)
    }

    /// Value of field `name`, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the form carries a field called `name`.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets field `name`, replacing an existing value or appending.
    pub fn set(&mut self, name: &str, value: String) {
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value;
        } else {
            self.fields.push((name.to_owned(), value));
        }
    }

    /// The username field: the first conventional name present.
    #[must_use]
    pub fn user_field(&self) -> Option<&'static str> {
        USER_FIELD_CANDIDATES.iter().copied().find(|c| self.has(c))
    }

    /// The password field: a conventional name if present, otherwise the
    /// first password-typed input on the page.
    #[must_use]
    pub fn password_field(&self) -> Option<String> {
        PASSWORD_FIELD_CANDIDATES
            .iter()
            .find(|c| self.has(c))
            .map(|c| (*c).to_owned())
            .or_else(|| self.password_inputs.first().cloned())
    }

    /// Names of all fields, for diagnostics.
    #[must_use]
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(k, _)| k.as_str()).collect()
    }
}

fn named_input(input: ElementRef<'_>) -> Option<(String, String)> {
    let name = non_empty(input.value().attr("name"))?;
    let value = input.value().attr("value").unwrap_or_default().to_owned();
    Some((name, value))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_owned)
}
