//! Deterministic event sampling

use sha2::{Digest, Sha256};

use super::definition::SampleDefinition;
use super::template::{StringTemplate, TemplateContext};
use super::RuleError;

/// Accepts a stable fraction of events keyed by a hashed template.
#[derive(Debug, Clone)]
pub struct Sampler {
    rate: f64,
    hash_template: StringTemplate,
}

impl Sampler {
    /// Compiles a sampler.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidOption` when `rate` is outside `[0, 1]`,
    /// or `RuleError::InvalidTemplate` for a bad hash template.
    pub fn compile(def: &SampleDefinition) -> Result<Self, RuleError> {
        if !(0.0..=1.0).contains(&def.rate) {
            return Err(RuleError::InvalidOption(format!(
                "sample rate must be within [0, 1], got {}",
                def.rate
            )));
        }
        Ok(Self {
            rate: def.rate,
            hash_template: StringTemplate::compile(&def.hash_template)?,
        })
    }

    /// Sampling rate.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Returns true if the event described by `ctx` is sampled in.
    pub fn accept(&self, ctx: &TemplateContext<'_>) -> bool {
        self.accept_key(&self.hash_template.expand_string(ctx))
    }

    fn accept_key(&self, key: &str) -> bool {
        let digest = Sha256::digest(key.as_bytes());
        let mut leading = [0u8; 8];
        leading.copy_from_slice(&digest[..8]);
        let position = u64::from_be_bytes(leading) as f64 / u64::MAX as f64;
        position < self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sampler(rate: f64) -> Sampler {
        Sampler::compile(&SampleDefinition {
            rate,
            hash_template: "{message.meta.domain}-{message.title}".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_rate_bounds() {
        let bad = SampleDefinition {
            rate: 1.5,
            hash_template: "x".to_string(),
        };
        assert!(matches!(
            Sampler::compile(&bad),
            Err(RuleError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_extremes() {
        let all = sampler(1.0);
        let none = sampler(0.0);
        for i in 0..50 {
            let key = format!("key-{}", i);
            assert!(all.accept_key(&key));
            assert!(!none.accept_key(&key));
        }
    }

    #[test]
    fn test_deterministic() {
        let s = sampler(0.5);
        let message = json!({"meta": {"domain": "en.wikipedia.org"}, "title": "Foo"});
        let empty = json!({});
        let ctx = TemplateContext {
            message: &message,
            matched: &empty,
            globals: &empty,
            request: &empty,
        };
        let first = s.accept(&ctx);
        for _ in 0..10 {
            assert_eq!(s.accept(&ctx), first);
        }
    }

    #[test]
    fn test_rate_is_roughly_respected() {
        let s = sampler(0.25);
        let accepted = (0..4000)
            .filter(|i| s.accept_key(&format!("page-{}", i)))
            .count();
        assert!((800..1200).contains(&accepted), "accepted {}", accepted);
    }
}
