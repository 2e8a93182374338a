//! Handling rules: an ordered pattern list deciding which directory entries
//! are hidden and which get a gzip alias.

use regex::Regex;

use crate::Error;

/// Special handling for entries whose name matches a pattern.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    hide: bool,
    gzip_alias: Option<String>,
}

impl Rule {
    /// A rule with no special effect. With an empty pattern this is the
    /// terminating catch-all (an empty regex matches every name).
    pub fn new(pattern: &str) -> Result<Self, Error> {
        Ok(Self {
            pattern: compile(pattern)?,
            hide: false,
            gzip_alias: None,
        })
    }

    /// Matching entries are excluded from the tree entirely.
    pub fn hide(pattern: &str) -> Result<Self, Error> {
        Ok(Self {
            pattern: compile(pattern)?,
            hide: true,
            gzip_alias: None,
        })
    }

    /// Matching non-directory entries additionally get an alias named by
    /// applying `template` (with `$n` back-references into the match) to
    /// their name. The alias is served with `Content-Encoding: gzip`.
    pub fn gzip(pattern: &str, template: &str) -> Result<Self, Error> {
        Ok(Self {
            pattern: compile(pattern)?,
            hide: false,
            gzip_alias: Some(template.to_owned()),
        })
    }

    /// Hides the matching entry itself. An alias derived from it is still
    /// placed, so a compressed file can be reachable only under its alias.
    pub fn hidden(mut self) -> Self {
        self.hide = true;
        self
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    pub fn hides(&self) -> bool {
        self.hide
    }

    /// The alias name for `name`, if this rule defines one.
    pub fn alias_for(&self, name: &str) -> Option<String> {
        self.gzip_alias
            .as_deref()
            .map(|template| self.pattern.replace(name, template).into_owned())
    }

    fn is_catch_all(&self) -> bool {
        self.pattern.as_str().is_empty()
    }
}

fn compile(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|e| Error::InvalidPattern(pattern.to_owned(), e))
}

/// An ordered rule list. Lookup is first-match and total: construction
/// requires the last rule to be a catch-all (empty pattern), which is split
/// off so there is always a fallback.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    catch_all: Rule,
}

impl RuleSet {
    pub fn new(mut rules: Vec<Rule>) -> Result<Self, Error> {
        match rules.pop() {
            Some(last) if last.is_catch_all() => Ok(Self {
                rules,
                catch_all: last,
            }),
            _ => Err(Error::MissingCatchAll),
        }
    }

    /// The default handling: dotfiles and editor droppings are hidden, the
    /// usual pre-compressed web asset extensions are aliased to their plain
    /// names.
    pub fn defaults() -> Result<Self, Error> {
        Self::new(vec![
            Rule::hide(r"^\.")?,
            Rule::hide(r"~$")?,
            Rule::hide(r"%$")?,
            Rule::hide(r"\.bak$")?,
            Rule::gzip(r"\.svgz$", ".svg")?,
            Rule::gzip(r"\.svg\.gz$", ".svg")?,
            Rule::gzip(r"\.css\.gz$", ".css")?,
            Rule::gzip(r"\.js\.gz$", ".js")?,
            Rule::gzip(r"\.json\.gz$", ".json")?,
            Rule::gzip(r"\.ps\.gz$", ".ps")?,
            Rule::gzip(r"\.pdf\.gz$", ".pdf")?,
            Rule::gzip(r"\.txt\.gz$", ".txt")?,
            Rule::gzip(r"\.xml\.gz$", ".xml")?,
            Rule::gzip(r"\.xhtml\.gz$", ".xhtml")?,
            Rule::gzip(r"\.htm\.gz$", ".htm")?,
            Rule::gzip(r"\.html\.gz$", ".html")?,
            Rule::gzip(r"^([^.]+)\.gz$", "$1")?,
            Rule::new("")?,
        ])
    }

    /// The first rule matching `name`. Always succeeds.
    pub fn lookup(&self, name: &str) -> &Rule {
        self.rules
            .iter()
            .find(|r| r.is_match(name))
            .unwrap_or(&self.catch_all)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[test]
    fn requires_catch_all() {
        assert!(matches!(
            RuleSet::new(vec![Rule::hide(r"^\.").unwrap()]),
            Err(Error::MissingCatchAll)
        ));
        assert!(RuleSet::new(vec![]).is_err());
        assert!(RuleSet::new(vec![Rule::new("").unwrap()]).is_ok());
    }

    #[test]
    fn first_match_wins() {
        let rules = RuleSet::new(vec![
            Rule::hide(r"\.gz$").unwrap(),
            Rule::gzip(r"\.html\.gz$", ".html").unwrap(),
            Rule::new("").unwrap(),
        ])
        .unwrap();

        // Matched by the first rule even though the second also matches.
        assert!(rules.lookup("page.html.gz").hides());
        assert!(rules.lookup("page.html.gz").alias_for("page.html.gz").is_none());
    }

    #[test]
    fn lookup_is_total() {
        let rules = RuleSet::new(vec![Rule::new("").unwrap()]).unwrap();
        assert!(!rules.lookup("anything-at-all").hides());
        assert!(!rules.lookup("").hides());
    }

    #[rstest]
    #[case("logo.svgz", Some("logo.svg"))]
    #[case("app.js.gz", Some("app.js"))]
    #[case("README.gz", Some("README"))]
    #[case("index.html", None)]
    #[case("archive.tar.gz", None)]
    fn default_aliases(#[case] name: &str, #[case] alias: Option<&str>) {
        let rules = RuleSet::defaults().unwrap();
        assert_eq!(
            rules.lookup(name).alias_for(name).as_deref(),
            alias,
            "alias for {name}"
        );
    }

    #[rstest]
    #[case(".htaccess", true)]
    #[case("draft.txt~", true)]
    #[case("autosave%", true)]
    #[case("old.bak", true)]
    #[case("index.html", false)]
    fn default_hiding(#[case] name: &str, #[case] hidden: bool) {
        let rules = RuleSet::defaults().unwrap();
        assert_eq!(rules.lookup(name).hides(), hidden, "hide for {name}");
    }

    #[test]
    fn hidden_gzip_rule_still_aliases() {
        let rule = Rule::gzip(r"\.html\.gz$", ".html").unwrap().hidden();
        assert!(rule.hides());
        assert_eq!(rule.alias_for("a.html.gz").as_deref(), Some("a.html"));
    }
}
