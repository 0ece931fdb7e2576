/// Resolves a request's provider + model, honoring a `<provider>/<model>`
/// prefix override (spec §4.7 step 1, §6 "model-name routing"). Unprefixed
/// names route to `default_provider`.
pub fn resolve_route(default_provider: &str, model: &str) -> (String, String) {
    match model.split_once('/') {
        Some((provider, rest)) if !provider.is_empty() && !rest.is_empty() => (provider.to_string(), rest.to_string()),
        _ => (default_provider.to_string(), model.to_string()),
    }
}
