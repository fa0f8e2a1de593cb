use std::fmt;

/// A push target such as `ghcr.io/org/app`. The tag is chosen per build.
#[derive(Debug, PartialEq, Eq)]
pub struct TargetReference {
    pub registry: String,
    pub repository: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    MissingRegistry,
    MissingRepository,
    InvalidFormat(String),
    DigestNotAllowed,
    TagNotAllowed,
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestNotAllowed => write!(f, "digest references are not allowed"),
            ParseError::TagNotAllowed => write!(f, "target must not carry a tag"),
            ParseError::MissingRegistry => write!(f, "registry is missing"),
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for TargetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

impl TargetReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.contains('@') {
            return Err(ParseError::DigestNotAllowed);
        }

        // a colon after the last slash is a tag, before it a registry port
        if let Some(pos) = s.rfind(':') {
            let last_slash = s.rfind('/').unwrap_or(0);
            if pos > last_slash {
                return Err(ParseError::TagNotAllowed);
            }
        }

        let parts: Vec<&str> = s.splitn(2, '/').collect();
        if parts.len() != 2 {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let registry = parts[0];
        let repository = parts[1];

        if registry.is_empty() {
            return Err(ParseError::MissingRegistry);
        }
        if repository.is_empty() {
            return Err(ParseError::MissingRepository);
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
        })
    }
}
