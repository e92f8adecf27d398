use crate::{ArkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The registry's uniform list envelope.
///
/// `next`/`previous` are full URLs; the follow-up request reuses their query
/// parameters unmodified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PagedResponse<T> {
    pub count: u64,
    #[serde(default = "none_link")]
    pub next: Option<String>,
    #[serde(default = "none_link")]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

fn none_link() -> Option<String> {
    None
}

impl<T> PagedResponse<T> {
    pub fn has_next(&self) -> bool {
        self.next.as_deref().is_some_and(|link| !link.is_empty())
    }

    /// Extracts the query parameters of the `next` link, if any.
    pub fn next_page_params(&self) -> Result<Option<BTreeMap<String, String>>> {
        let Some(link) = self.next.as_deref().filter(|link| !link.is_empty()) else {
            return Ok(None);
        };

        let url = reqwest::Url::parse(link)
            .map_err(|error| ArkError::Registry(format!("invalid next link '{}': {}", link, error)))?;

        let params = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        Ok(Some(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_page_params_extracts_query_pairs() {
        let page: PagedResponse<u32> = PagedResponse {
            count: 120,
            next: Some("https://registry.example/api/v1/bags/?page=2&page_size=50&admin_node=chron".to_string()),
            previous: None,
            results: vec![1, 2, 3],
        };

        let params = page.next_page_params().unwrap().unwrap();
        assert_eq!(params.get("page").map(String::as_str), Some("2"));
        assert_eq!(params.get("page_size").map(String::as_str), Some("50"));
        assert_eq!(params.get("admin_node").map(String::as_str), Some("chron"));
    }

    #[test]
    fn test_empty_next_link_ends_pagination() {
        let page: PagedResponse<u32> = PagedResponse {
            count: 3,
            next: Some(String::new()),
            previous: None,
            results: vec![],
        };
        assert!(!page.has_next());
        assert!(page.next_page_params().unwrap().is_none());
    }

    #[test]
    fn test_envelope_field_names() {
        let raw = r#"{"Count":1,"Next":null,"Previous":null,"Results":[7]}"#;
        let page: PagedResponse<u32> = serde_json::from_str(raw).unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.results, vec![7]);
        assert!(!page.has_next());
    }
}
