/// Message headers accumulated in arrival order.
///
/// Name lookups are ASCII case-insensitive. Duplicate names are kept in the
/// order they were streamed, which is what gives change/insert header
/// indices their meaning: index N addresses the N-th field of that name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderMap {
    fields: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.fields.push((name.into(), value.into()));
    }

    /// The first field of the given name, if any.
    pub fn get_first<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.iter_named(name).next()
    }

    /// Values of every field of the given name, in arrival order.
    pub fn iter_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.add("From", "from@example.org");
        headers.add("DKIM-Signature", "one");
        headers.add("dkim-signature", "two");

        assert_eq!(headers.get_first("from"), Some("from@example.org"));
        assert_eq!(
            headers.iter_named("Dkim-Signature").collect::<Vec<_>>(),
            ["one", "two"]
        );
        assert_eq!(headers.get_first("Reply-To"), None);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn empty_values_are_real_fields() {
        let mut headers = HeaderMap::new();
        headers.add("x-empty-header", "");
        assert_eq!(headers.get_first("X-Empty-Header"), Some(""));
        assert_eq!(headers.iter_named("x-empty-header").collect::<Vec<_>>(), [""]);
    }
}
