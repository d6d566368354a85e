//! Server-rendered HTML for the handful of pages the admin UI needs.

use crate::session::Flash;

pub fn index() -> String {
    r#"<h1 align="center" style="margin-top:200px;">Hello, World!</h1>"#.to_string()
}

pub fn login(flashes: &[Flash]) -> String {
    layout(
        "Login",
        flashes,
        r#"<form method="post" action="/login">
  <label>Password <input type="password" name="password" autofocus required></label>
  <button type="submit">Log in</button>
</form>"#,
    )
}

pub fn change_password(flashes: &[Flash]) -> String {
    layout(
        "Change password",
        flashes,
        r#"<form method="post" action="/change-password">
  <label>New password <input type="password" name="password" required></label>
  <button type="submit">Save</button>
</form>
<p><a href="/dashboard">Back to dashboard</a></p>"#,
    )
}

/// Upload form plus a player for whatever is currently staged.
pub fn dashboard(flashes: &[Flash], video: Option<&str>, subtitle: Option<&str>) -> String {
    let mut body = String::from(
        r#"<form method="post" action="/dashboard" enctype="multipart/form-data">
  <label>Video <input type="file" name="video" accept="video/*" required></label>
  <label>Subtitle (optional) <input type="file" name="subtitle" accept=".vtt,.srt,.ass,.ssa"></label>
  <button type="submit">Upload</button>
</form>
"#,
    );

    if let Some(video) = video {
        body.push_str(&format!(
            "<video controls preload=\"metadata\" width=\"720\">\n  <source src=\"/static/{}\">\n",
            escape(video)
        ));
        if let Some(subtitle) = subtitle {
            body.push_str(&format!(
                "  <track kind=\"subtitles\" src=\"/static/{}\" default>\n",
                escape(subtitle)
            ));
        }
        body.push_str("</video>\n");
        body.push_str(&format!(
            "<p>Video: <a href=\"/static/{0}\">{0}</a></p>\n",
            escape(video)
        ));
        match subtitle {
            Some(subtitle) => body.push_str(&format!(
                "<p>Subtitle: <a href=\"/static/{0}\">{0}</a></p>\n",
                escape(subtitle)
            )),
            None => body.push_str("<p>No subtitle available.</p>\n"),
        }
    }

    body.push_str(
        "<p><a href=\"/change-password\">Change password</a> | <a href=\"/logout\">Log out</a></p>",
    );
    layout("Dashboard", flashes, &body)
}

fn layout(title: &str, flashes: &[Flash], body: &str) -> String {
    let mut flash_html = String::new();
    if !flashes.is_empty() {
        flash_html.push_str("<ul class=\"flashes\">\n");
        for flash in flashes {
            flash_html.push_str(&format!(
                "  <li class=\"{}\">{}</li>\n",
                flash.level.as_str(),
                escape(&flash.message)
            ));
        }
        flash_html.push_str("</ul>\n");
    }
    format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>\n{flash_html}{body}\n</body>\n</html>\n",
        title = escape(title),
    )
}

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
