//! Rewriting of infrastructure templates copied out of the distributor's
//! store.
//!
//! Templates reference their companion artifacts by bucket. Once copied, those
//! references must point at the local store instead.

use regex::bytes::{Captures, Regex};

const TEMPLATE_EXTENSIONS: [&str; 3] = [".yaml", ".yml", ".template"];
const TEMPLATE_HEADER: &[u8] = b"AWSTemplateFormatVersion";

/// Rewrites distributor bucket references to the local bucket.
#[derive(Debug, Clone)]
pub struct TemplateRewriter {
    target_bucket: String,
    literal: Regex,
    regional_url: Regex,
}

impl TemplateRewriter {
    /// Creates a rewriter from `distributor_bucket` to `target_bucket`.
    pub fn new(
        distributor_bucket: &str,
        target_bucket: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let escaped = regex::escape(distributor_bucket);
        let literal = Regex::new(&format!(
            r"(S3Bucket: |Bucket: |s3://|https://|Default: ){escaped}"
        ))?;
        let regional_url = Regex::new(&format!(r"https://s3\.(.*?)\.amazonaws\.com/{escaped}"))?;

        Ok(Self {
            target_bucket: target_bucket.into(),
            literal,
            regional_url,
        })
    }

    /// Returns true if `key`/`body` look like an infrastructure template.
    #[must_use]
    pub fn is_template(key: &str, body: &[u8]) -> bool {
        TEMPLATE_EXTENSIONS.iter().any(|ext| key.ends_with(ext))
            && body.starts_with(TEMPLATE_HEADER)
    }

    /// Rewrites every distributor reference in `body`.
    #[must_use]
    pub fn rewrite(&self, body: &[u8]) -> Vec<u8> {
        let target = self.target_bucket.as_bytes();

        let pass = self.literal.replace_all(body, |caps: &Captures<'_>| {
            let mut out = caps[1].to_vec();
            out.extend_from_slice(target);
            out
        });

        let virtual_host = format!("https://{}.s3.amazonaws.com", self.target_bucket);
        self.regional_url
            .replace_all(&pass, |_: &Captures<'_>| virtual_host.as_bytes().to_vec())
            .into_owned()
    }

    /// Rewrites `body` if it is a template, otherwise returns it unchanged.
    #[must_use]
    pub fn apply(&self, key: &str, body: Vec<u8>) -> Vec<u8> {
        if Self::is_template(key, &body) {
            self.rewrite(&body)
        } else {
            body
        }
    }
}
