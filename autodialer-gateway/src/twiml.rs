/// Voice-response document that speaks `message` once.
pub fn say(message: &str, voice: &str, language: &str) -> String {
    format!(
        "<Response><Say voice=\"{}\" language=\"{}\">{}</Say></Response>",
        escape(voice),
        escape(language),
        escape(message)
    )
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
