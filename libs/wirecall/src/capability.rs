//! Capabilities wrap pipeline components at build time.
//!
//! A capability sees each component exactly once, while the dispatcher is
//! assembled. Every hook defaults to identity, so implementations override
//! only the seams they care about. Registration order is wrapping order:
//! the last registered capability becomes the outermost wrapper.

use std::sync::Arc;

use crate::client::Client;
use crate::codec::{Decoder, Encoder, ErrorDecoder};

pub trait Capability: Send + Sync {
    fn enrich_client(&self, client: Arc<dyn Client>) -> Arc<dyn Client> {
        client
    }

    fn enrich_encoder(&self, encoder: Arc<dyn Encoder>) -> Arc<dyn Encoder> {
        encoder
    }

    fn enrich_decoder(&self, decoder: Arc<dyn Decoder>) -> Arc<dyn Decoder> {
        decoder
    }

    fn enrich_error_decoder(&self, error_decoder: Arc<dyn ErrorDecoder>) -> Arc<dyn ErrorDecoder> {
        error_decoder
    }
}

pub(crate) fn enrich_client(
    capabilities: &[Arc<dyn Capability>],
    client: Arc<dyn Client>,
) -> Arc<dyn Client> {
    capabilities
        .iter()
        .fold(client, |inner, cap| cap.enrich_client(inner))
}

pub(crate) fn enrich_encoder(
    capabilities: &[Arc<dyn Capability>],
    encoder: Arc<dyn Encoder>,
) -> Arc<dyn Encoder> {
    capabilities
        .iter()
        .fold(encoder, |inner, cap| cap.enrich_encoder(inner))
}

pub(crate) fn enrich_decoder(
    capabilities: &[Arc<dyn Capability>],
    decoder: Arc<dyn Decoder>,
) -> Arc<dyn Decoder> {
    capabilities
        .iter()
        .fold(decoder, |inner, cap| cap.enrich_decoder(inner))
}

pub(crate) fn enrich_error_decoder(
    capabilities: &[Arc<dyn Capability>],
    error_decoder: Arc<dyn ErrorDecoder>,
) -> Arc<dyn ErrorDecoder> {
    capabilities
        .iter()
        .fold(error_decoder, |inner, cap| cap.enrich_error_decoder(inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EncodeError;
    use crate::request::RequestTemplate;
    use crate::codec::{BodyValue, JsonEncoder, ResultType};

    struct Tagging(&'static str);

    struct TaggingEncoder {
        tag: &'static str,
        inner: Arc<dyn Encoder>,
    }

    impl Encoder for TaggingEncoder {
        fn encode(
            &self,
            value: &BodyValue,
            declared: &ResultType,
            template: &mut RequestTemplate,
        ) -> Result<(), EncodeError> {
            template.header("X-Encoded-By", self.tag);
            self.inner.encode(value, declared, template)
        }
    }

    impl Capability for Tagging {
        fn enrich_encoder(&self, encoder: Arc<dyn Encoder>) -> Arc<dyn Encoder> {
            Arc::new(TaggingEncoder {
                tag: self.0,
                inner: encoder,
            })
        }
    }

    #[test]
    fn capabilities_wrap_in_registration_order() {
        let caps: Vec<Arc<dyn Capability>> =
            vec![Arc::new(Tagging("first")), Arc::new(Tagging("second"))];
        let encoder = enrich_encoder(&caps, Arc::new(JsonEncoder));
        let mut template = RequestTemplate::new();
        encoder
            .encode(
                &BodyValue::Json(serde_json::json!({})),
                &ResultType::unit(),
                &mut template,
            )
            .unwrap();
        // Outermost wrapper (last registered) runs first.
        assert_eq!(
            template.headers()[0],
            (
                "X-Encoded-By".to_owned(),
                vec!["second".to_owned(), "first".to_owned()]
            )
        );
    }

    #[test]
    fn default_hooks_are_identity() {
        struct Noop;
        impl Capability for Noop {}
        let caps: Vec<Arc<dyn Capability>> = vec![Arc::new(Noop)];
        let encoder: Arc<dyn Encoder> = Arc::new(JsonEncoder);
        let enriched = enrich_encoder(&caps, Arc::clone(&encoder));
        assert!(Arc::ptr_eq(&encoder, &enriched));
    }
}
