//! A request together with its current response and the redirect hops it went through.

use url::Url;

use crate::http::{Request, Response};

/// One logical request across its redirect chain.
///
/// The original request is never modified. Every redirect response passed to
/// [`set_response`](Self::set_response) appends the resolved `Location` to
/// [`redirects`](Self::redirects), unless it equals the last recorded hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespondedRequest {
    request: Request,
    response: Response,
    redirects: Vec<Url>,
}

impl RespondedRequest {
    /// Creates the aggregate. A redirect `response` already records one hop.
    #[must_use]
    pub fn new(request: Request, response: Response) -> Self {
        let mut aggregate = Self {
            request,
            response: Response::new(0),
            redirects: Vec::new(),
        };
        aggregate.set_response(response);
        aggregate
    }

    /// Replaces the current response, recording a hop if it is a redirect.
    pub fn set_response(&mut self, response: Response) {
        self.set_response_with_location(response, None);
    }

    /// Like [`set_response`](Self::set_response), with an explicit redirect target that
    /// takes precedence over the response's `Location` header.
    pub fn set_response_with_location(&mut self, response: Response, location: Option<&str>) {
        if response.is_redirect() {
            let target = location.or_else(|| response.header("location"));
            if let Some(target) = target {
                self.add_redirect(target);
            }
        }
        self.response = response;
    }

    /// Consuming variant of [`set_response`](Self::set_response).
    #[must_use]
    pub fn with_response(mut self, response: Response) -> Self {
        self.set_response(response);
        self
    }

    /// Records a hop to `target` without a redirect response, e.g. when restoring a cached
    /// result whose effective URL differs from the requested one.
    pub fn record_redirect(&mut self, target: &Url) {
        self.add_redirect(target.as_str());
    }

    fn add_redirect(&mut self, target: &str) {
        let Ok(resolved) = self.effective_uri().join(target) else {
            tracing::debug!(location = %target, "ignoring unresolvable redirect location");
            return;
        };
        if self.redirects.last() != Some(&resolved) {
            self.redirects.push(resolved);
        }
    }

    /// The last redirect target, or the original request URL.
    #[must_use]
    pub fn effective_uri(&self) -> &Url {
        self.redirects.last().unwrap_or(&self.request.url)
    }

    /// The originally requested URL.
    #[must_use]
    pub fn requested_uri(&self) -> &Url {
        &self.request.url
    }

    /// Whether the current response is a redirect.
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        self.response.is_redirect()
    }

    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Recorded redirect hops in chronological order.
    #[must_use]
    pub fn redirects(&self) -> &[Url] {
        &self.redirects
    }

    /// Splits into request and current response.
    #[must_use]
    pub fn into_parts(self) -> (Request, Response) {
        (self.request, self.response)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(url: &str) -> Request {
        Request::parse_get(url).unwrap()
    }

    fn redirect(location: &str) -> Response {
        Response::new(301).with_header("Location", location)
    }

    #[test]
    fn test_without_redirect_effective_equals_requested() {
        let aggregate = RespondedRequest::new(request("https://www.example.com/a"), Response::new(200));
        assert_eq!(aggregate.effective_uri(), aggregate.requested_uri());
        assert!(aggregate.redirects().is_empty());
        assert!(!aggregate.is_redirect());
    }

    #[test]
    fn test_redirect_then_success_records_hop() {
        let mut aggregate = RespondedRequest::new(
            request("https://www.example.com/a"),
            redirect("https://www.example.com/b"),
        );
        assert!(aggregate.is_redirect());

        aggregate.set_response(Response::new(200));

        let target = Url::parse("https://www.example.com/b").unwrap();
        assert_eq!(aggregate.effective_uri(), &target);
        assert_eq!(aggregate.redirects(), [target]);
        assert_eq!(aggregate.requested_uri().as_str(), "https://www.example.com/a");
    }

    #[test]
    fn test_relative_location_resolves_against_effective_uri() {
        let mut aggregate = RespondedRequest::new(
            request("https://www.example.com/dir/a"),
            redirect("https://other.example.org/x/y"),
        );
        aggregate.set_response(redirect("z"));
        aggregate.set_response(redirect("/root"));

        let hops: Vec<&str> = aggregate.redirects().iter().map(Url::as_str).collect();
        assert_eq!(
            hops,
            vec![
                "https://other.example.org/x/y",
                "https://other.example.org/x/z",
                "https://other.example.org/root",
            ]
        );
    }

    #[test]
    fn test_immediately_repeated_hop_is_recorded_once() {
        let mut aggregate = RespondedRequest::new(
            request("https://www.example.com/"),
            redirect("/login"),
        );
        aggregate.set_response(redirect("/login"));
        assert_eq!(aggregate.redirects().len(), 1);
    }

    #[test]
    fn test_explicit_location_overrides_header() {
        let mut aggregate = RespondedRequest::new(request("https://www.example.com/"), Response::new(200));
        aggregate.set_response_with_location(redirect("/ignored"), Some("/chosen"));
        assert_eq!(aggregate.effective_uri().path(), "/chosen");
    }

    #[test]
    fn test_redirect_without_location_records_nothing() {
        let aggregate = RespondedRequest::new(request("https://www.example.com/"), Response::new(304));
        assert!(aggregate.is_redirect());
        assert!(aggregate.redirects().is_empty());
    }

    #[test]
    fn test_with_response_transition() {
        let aggregate = RespondedRequest::new(request("https://www.example.com/"), redirect("/next"))
            .with_response(Response::new(200).with_body("done"));
        assert_eq!(aggregate.response().body, b"done");
        assert_eq!(aggregate.effective_uri().path(), "/next");
    }
}
