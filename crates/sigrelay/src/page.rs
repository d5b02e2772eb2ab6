use crate::server::ServerState;
use axum::extract::State;
use axum::response::Html;
use std::sync::Arc;

const TEMPLATE: &str = include_str!("../assets/index.html");
const WS_URL_SLOT: &str = "{{ws_url}}";

/// `GET /`: the browser bootstrap page, pointed at the advertised endpoint.
pub async fn index(State(state): State<Arc<ServerState>>) -> Html<String> {
    Html(render(&state.config.client_ws_url()))
}

/// Substitute the WebSocket URL into the page as a JSON string literal.
fn render(ws_url: &str) -> String {
    let literal = serde_json::Value::from(ws_url).to_string();
    TEMPLATE.replace(WS_URL_SLOT, &literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_has_slot() {
        assert_eq!(TEMPLATE.matches(WS_URL_SLOT).count(), 1);
    }

    #[test]
    fn render_embeds_quoted_url() {
        let page = render("ws://relay.example.com:8080/ws");
        assert!(page.contains(r#"const WS_URL = "ws://relay.example.com:8080/ws";"#));
        assert!(!page.contains(WS_URL_SLOT));
    }

    #[test]
    fn render_escapes_quotes() {
        let page = render(r#"ws://a"b/ws"#);
        assert!(page.contains(r#""ws://a\"b/ws""#));
    }
}
