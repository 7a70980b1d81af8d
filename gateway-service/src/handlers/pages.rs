//! Minimal server-rendered pages for the browser legs of enrollment.
//! The admin SPA is served elsewhere; these pages only cover the
//! user-code entry and section selection steps.

use crate::services::web_flow::SectionChoice;

pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title}</title>\n\
         <style>body{{font-family:sans-serif;max-width:30rem;margin:3rem auto;padding:0 1rem}}\
         input,button,select{{font-size:1.2rem;padding:.5rem}}</style>\n\
         </head>\n<body>\n{body}\n</body>\n</html>\n",
        title = html_escape(title),
        body = body
    )
}

pub fn user_code_entry(prefill: Option<&str>) -> String {
    let value = prefill.map(html_escape).unwrap_or_default();
    page(
        "Connect your scoreboard",
        &format!(
            "<h1>Connect your scoreboard</h1>\n\
             <p>Enter the code shown on the device display.</p>\n\
             <form method=\"post\">\n\
             <input name=\"user_code\" value=\"{value}\" placeholder=\"ABCD-EFGH\" \
             autocomplete=\"off\" autofocus maxlength=\"9\">\n\
             <button type=\"submit\">Continue</button>\n\
             </form>"
        ),
    )
}

pub fn section_picker(device_code: &str, sections: &[SectionChoice], select_path: &str) -> String {
    let mut options = String::new();
    for section in sections {
        options.push_str(&format!(
            "<option value=\"{}\">{}</option>\n",
            section.section_id,
            html_escape(&section.section_name)
        ));
    }
    options.push_str("<option value=\"0\">Ad-hoc teams (no OSM section)</option>\n");

    page(
        "Choose a section",
        &format!(
            "<h1>Choose a section</h1>\n\
             <p>Pick the section this scoreboard should display.</p>\n\
             <form method=\"post\" action=\"{}\">\n\
             <input type=\"hidden\" name=\"device_code\" value=\"{}\">\n\
             <select name=\"section_id\">\n{}</select>\n\
             <button type=\"submit\">Authorize device</button>\n\
             </form>",
            html_escape(select_path),
            html_escape(device_code),
            options
        ),
    )
}

pub fn device_authorized() -> String {
    page(
        "Device authorized",
        "<h1>All done</h1>\n<p>Your scoreboard will finish signing in within a few seconds. \
         You can close this page.</p>",
    )
}

pub fn authorization_declined() -> String {
    page(
        "Authorization declined",
        "<h1>Authorization declined</h1>\n<p>The device was not connected. \
         You can close this page.</p>",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_neutralizes_markup() {
        assert_eq!(
            html_escape("<script>alert('x')</script>"),
            "&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;"
        );
        assert_eq!(html_escape("Tom & Co \"Ltd\""), "Tom &amp; Co &quot;Ltd&quot;");
    }

    #[test]
    fn section_picker_escapes_names_and_offers_adhoc() {
        let sections = vec![SectionChoice {
            section_id: 1001,
            section_name: "1st <Example>".into(),
        }];
        let html = section_picker("dc", &sections, "/oauth/select-section");
        assert!(html.contains("1st &lt;Example&gt;"));
        assert!(html.contains("value=\"0\""));
        assert!(html.contains("value=\"1001\""));
    }
}
