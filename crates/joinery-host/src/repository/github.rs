//! Repository URL normalisation for the GitHub hosting conventions.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// File name of a repository manifest.
pub const MANIFEST_FILE: &str = "manifest.imjoy.json";

const GITHUB_PREFIXES: [&str; 2] = ["https://github.com/", "http://github.com/"];
const RAW_HOST: &str = "https://raw.githubusercontent.com";
const DEFAULT_BRANCH: &str = "master";

static SHORTHAND: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[^/.]+/[^/.]+$").ok());

/// Canonical manifest URL and repository origin derived from a repository URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLocation {
    /// URL the manifest is fetched from.
    pub url: String,
    /// Origin prefix stamped on every manifest entry.
    pub origin: String,
}

/// Strips the GitHub scheme-and-host prefix so equivalent URLs compare equal.
#[must_use]
pub fn normalize_repository_url(url: &str) -> String {
    GITHUB_PREFIXES
        .iter()
        .find_map(|prefix| url.strip_prefix(prefix))
        .unwrap_or(url)
        .to_owned()
}

/// Derives the manifest URL and origin for a repository.
///
/// `owner/repo` shorthands (optionally at `tag`) and GitHub URLs are mapped
/// to the raw manifest file; anything else is used literally.
#[must_use]
pub fn resolve_manifest_url(url: &str, tag: Option<&str>) -> ManifestLocation {
    let is_shorthand = SHORTHAND.as_ref().is_some_and(|re| re.is_match(url));
    if is_shorthand {
        let (repository_url, origin) = match tag {
            Some(git_ref) => (
                format!("https://github.com/{url}/tree/{git_ref}"),
                format!("{url}@{git_ref}"),
            ),
            None => (format!("https://github.com/{url}"), url.to_owned()),
        };
        let manifest = GithubPath::parse(&repository_url)
            .map_or(repository_url, |path| path.manifest_url());
        return ManifestLocation {
            url: manifest,
            origin,
        };
    }
    if url.contains("github.com") {
        if let Some(path) = GithubPath::parse(url) {
            return ManifestLocation {
                url: path.manifest_url(),
                origin: path.origin(),
            };
        }
    }
    ManifestLocation {
        url: url.to_owned(),
        origin: url.to_owned(),
    }
}

/// Rewrites a GitHub "view source" link (`/blob/`) to its raw-content URL.
///
/// Returns `None` when `url` is not a GitHub blob link.
#[must_use]
pub fn github_raw_url(url: &str) -> Option<String> {
    let path = GithubPath::parse(url)?;
    if path.view != Some("blob") {
        return None;
    }
    Some(path.raw_url(&path.rest.join("/")))
}

struct GithubPath {
    owner: String,
    repo: String,
    view: Option<&'static str>,
    reference: Option<String>,
    rest: Vec<String>,
}

impl GithubPath {
    fn parse(url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        if parsed.host_str() != Some("github.com") {
            return None;
        }
        let mut segments = parsed
            .path_segments()?
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned);
        let owner = segments.next()?;
        let raw_repo = segments.next()?;
        let repo = match raw_repo.strip_suffix(".git") {
            Some(stripped) => stripped.to_owned(),
            None => raw_repo,
        };
        let view = match segments.next().as_deref() {
            Some("tree") => Some("tree"),
            Some("blob") => Some("blob"),
            _ => None,
        };
        let reference = view.and_then(|_| segments.next());
        Some(Self {
            owner,
            repo,
            view,
            reference,
            rest: segments.collect(),
        })
    }

    fn reference(&self) -> &str {
        self.reference.as_deref().unwrap_or(DEFAULT_BRANCH)
    }

    fn raw_url(&self, file: &str) -> String {
        format!(
            "{RAW_HOST}/{}/{}/{}/{file}",
            self.owner,
            self.repo,
            self.reference()
        )
    }

    fn manifest_url(&self) -> String {
        let directory = self.rest.join("/");
        if directory.ends_with(".json") {
            self.raw_url(&directory)
        } else if directory.is_empty() {
            self.raw_url(MANIFEST_FILE)
        } else {
            self.raw_url(&format!("{directory}/{MANIFEST_FILE}"))
        }
    }

    fn origin(&self) -> String {
        match &self.reference {
            Some(reference) => format!("{}/{}@{reference}", self.owner, self.repo),
            None => format!("{}/{}", self.owner, self.repo),
        }
    }
}
