/// Query string parameters understood by the platform's list endpoints.
///
/// Well-known keys are typed; anything else goes through [`QueryParams::param`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    /// Server-side filter expression, e.g. `(name like 'a%')`.
    pub filter: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Sort expression, e.g. `name ASC`.
    pub order: Option<String>,
    /// Field projection; sent comma-separated.
    pub fields: Vec<String>,
    /// Related resources to expand; sent comma-separated.
    pub related: Vec<String>,
    /// Ask the server for `meta.count` alongside the records.
    pub include_count: bool,
    /// Free-form pairs appended after the typed keys.
    pub extra: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn related<I, S>(mut self, related: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.related = related.into_iter().map(Into::into).collect();
        self
    }

    pub fn include_count(mut self, include_count: bool) -> Self {
        self.include_count = include_count;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.to_pairs().is_empty()
    }

    /// Flattens into ordered key/value pairs, skipping unset keys.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(filter) = &self.filter {
            pairs.push(("filter".to_owned(), filter.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_owned(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_owned(), offset.to_string()));
        }
        if let Some(order) = &self.order {
            pairs.push(("order".to_owned(), order.clone()));
        }
        if !self.fields.is_empty() {
            pairs.push(("fields".to_owned(), self.fields.join(",")));
        }
        if !self.related.is_empty() {
            pairs.push(("related".to_owned(), self.related.join(",")));
        }
        if self.include_count {
            pairs.push(("include_count".to_owned(), "true".to_owned()));
        }
        pairs.extend(self.extra.iter().cloned());
        pairs
    }
}

impl From<()> for QueryParams {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

impl From<Vec<(String, String)>> for QueryParams {
    fn from(extra: Vec<(String, String)>) -> Self {
        Self {
            extra,
            ..Self::default()
        }
    }
}

impl<const N: usize> From<[(&str, &str); N]> for QueryParams {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self {
            extra: pairs
                .into_iter()
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect(),
            ..Self::default()
        }
    }
}
