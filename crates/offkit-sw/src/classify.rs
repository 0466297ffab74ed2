//! Picks a caching strategy for an intercepted request.

use offkit_net::{Destination, Request};
use url::Origin;

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Top-level document load: network first, cached shell on failure.
    Navigation,
    /// Own-origin sub-resource: cache first.
    SameOrigin,
    /// Image from another origin: stale-while-revalidate.
    CrossOriginImage,
    /// Left to the host's default network handling.
    Unhandled,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Navigation => "network-first",
            Strategy::SameOrigin => "cache-first",
            Strategy::CrossOriginImage => "stale-while-revalidate",
            Strategy::Unhandled => "passthrough",
        }
    }

    pub fn is_handled(&self) -> bool {
        *self != Strategy::Unhandled
    }
}

/// Classifies requests relative to the application's origin.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Origin,
}

impl Classifier {
    pub fn new(origin: Origin) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// First match wins: navigation, same origin, image, otherwise
    /// unhandled.
    pub fn classify(&self, request: &Request) -> Strategy {
        if request.is_navigation() {
            Strategy::Navigation
        } else if request.url.origin() == self.origin {
            Strategy::SameOrigin
        } else if request.destination == Destination::Image {
            Strategy::CrossOriginImage
        } else {
            Strategy::Unhandled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn classifier() -> Classifier {
        Classifier::new(Url::parse("https://app.example/").unwrap().origin())
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[test]
    fn test_navigation_wins_over_origin() {
        let request = Request::navigate(Url::parse("https://other.example/page").unwrap());
        assert_eq!(classifier().classify(&request), Strategy::Navigation);

        let request = Request::navigate(Url::parse("https://app.example/").unwrap());
        assert_eq!(classifier().classify(&request), Strategy::Navigation);
    }

    #[test]
    fn test_same_origin() {
        let request = get("https://app.example/assets/app.js").destination(Destination::Script);
        assert_eq!(classifier().classify(&request), Strategy::SameOrigin);
    }

    #[test]
    fn test_same_origin_image_is_cache_first() {
        let request = get("https://app.example/logo.png").destination(Destination::Image);
        assert_eq!(classifier().classify(&request), Strategy::SameOrigin);
    }

    #[test]
    fn test_port_and_scheme_are_part_of_origin() {
        assert_eq!(
            classifier().classify(&get("http://app.example/a.js")),
            Strategy::Unhandled
        );
        assert_eq!(
            classifier().classify(&get("https://app.example:8443/a.js")),
            Strategy::Unhandled
        );
    }

    #[test]
    fn test_cross_origin_image() {
        let request = get("https://cdn.example/photo.jpg").destination(Destination::Image);
        let strategy = classifier().classify(&request);
        assert_eq!(strategy, Strategy::CrossOriginImage);
        assert_eq!(strategy.name(), "stale-while-revalidate");
    }

    #[test]
    fn test_cross_origin_script_is_unhandled() {
        let request = get("https://cdn.example/lib.js").destination(Destination::Script);
        let strategy = classifier().classify(&request);
        assert_eq!(strategy, Strategy::Unhandled);
        assert!(!strategy.is_handled());
    }

    #[test]
    fn test_opaque_origin_never_matches() {
        let classifier = Classifier::new(Url::parse("data:text/plain,hi").unwrap().origin());
        let request = get("data:text/plain,hi");
        assert_eq!(classifier.classify(&request), Strategy::Unhandled);
    }
}
