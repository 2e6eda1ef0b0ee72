//! HTML pages served to the browser.
//!
use crate::upload::UploadOutcome;

const STYLE: &str = r#"
    body { font-family: sans-serif; margin: 2em auto; max-width: 60em; }
    .message { color: #b00020; }
    .label { font-weight: bold; }
    img { max-width: 100%; }
"#;

/// Index page with the upload form and, after an upload, its outcome.
pub fn index_page(outcome: Option<&UploadOutcome>) -> String {
    let result = match outcome {
        None => String::new(),
        Some(UploadOutcome::Detected { label, result_url }) => format!(
            r#"
        <h3>Detected: <span class="label">{}</span></h3>
        <img src="{}" alt="Detection result">"#,
            escape_html(label),
            escape_html(result_url)
        ),
        Some(outcome) => format!(
            r#"
        <p class="message">{}</p>"#,
            escape_html(outcome.message().unwrap_or_default())
        ),
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Object Detection</title>
    <style>{STYLE}</style>
</head>
<body>
    <div class="container">
        <h2>Object Detection</h2>
        <form method="post" action="/" enctype="multipart/form-data">
            <input type="file" name="file" accept="image/*">
            <button type="submit">Detect</button>
        </form>
        <p><a href="/camera">Live camera</a></p>{result}
    </div>
</body>
</html>
"#
    )
}

/// Page embedding the live detection stream.
pub fn camera_page() -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Live Detection</title>
    <style>{STYLE}</style>
</head>
<body>
    <div class="container">
        <h2>Live Detection</h2>
        <img src="/camera_feed" alt="Live camera stream">
        <p><a href="/">Upload an image</a></p>
    </div>
</body>
</html>
"#
    )
}

/// Escape text for use in HTML content and quoted attributes.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_index_has_upload_form() {
        let page = index_page(None);
        assert!(page.contains(r#"enctype="multipart/form-data""#));
        assert!(page.contains(r#"name="file""#));
        assert!(!page.contains("Detected:"));
    }

    #[test]
    fn index_shows_message() {
        let page = index_page(Some(&UploadOutcome::NoFile));
        assert!(page.contains("No file selected"));
    }

    #[test]
    fn index_shows_label_and_result() {
        let page = index_page(Some(&UploadOutcome::Detected {
            label: "dog".into(),
            result_url: "/static/results/1-0000/result_dog.jpg".into(),
        }));
        assert!(page.contains(r#"<span class="label">dog</span>"#));
        assert!(page.contains(r#"src="/static/results/1-0000/result_dog.jpg""#));
    }

    #[test]
    fn labels_are_escaped() {
        let page = index_page(Some(&UploadOutcome::Detected {
            label: "<script>alert('x')</script>".into(),
            result_url: "/a\"b".into(),
        }));
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt;"));
        assert!(page.contains("/a&quot;b"));
    }

    #[test]
    fn camera_page_embeds_stream() {
        assert!(camera_page().contains(r#"<img src="/camera_feed""#));
    }
}
