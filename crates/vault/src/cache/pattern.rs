use regex::Regex;

/// Glob over cache keys: `*` matches any run (including empty), `?` exactly
/// one character, everything else literally.  Anchored at both ends.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(glob: &str) -> Result<Self, regex::Error> {
        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        let mut buf = [0u8; 4];
        for ch in glob.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut buf))),
            }
        }
        source.push('$');

        // `(?s)` so wildcards also span newlines inside keys.
        let regex = Regex::new(&format!("(?s){source}"))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}
