use std::path::{Path, PathBuf};

use anyhow::Context;
use sitedock_site::LOCAL_HOST;

/// Script the launcher runs to serve a site.
pub const ENTRY_POINT: &str = "run_site.py";

/// Environment variable the generated app reads its port from.
pub const PORT_ENV: &str = "SITE_PORT";

/// Directories created for every site, relative to its root.
pub const SCAFFOLD_DIRS: &[&str] = &["static/css", "templates"];

#[derive(Debug, Clone)]
pub struct ScaffoldFile {
    pub rel_path: &'static str,
    pub contents: String,
}

const STYLE_CSS: &str = "body{font-family:'Segoe UI',sans-serif;\
background:linear-gradient(135deg,#667eea,#764ba2);\
margin:0;padding:0;color:#fff;text-align:center;}";

fn index_html(name: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{name}</title>
    <link rel='stylesheet' href='{{{{ url_for("static", filename="css/style.css") }}}}'>
</head>
<body>
    <h1>Welcome to {name}</h1>
    <p>Site running.</p>
</body>
</html>
"#
    )
}

fn app_py(port: u16) -> String {
    format!(
        r#"import os

from flask import Flask, render_template

HOST = '{LOCAL_HOST}'
PORT = int(os.environ.get('{PORT_ENV}', '{port}'))

app = Flask(__name__)


@app.route('/')
def home():
    return render_template('index.html')


if __name__ == '__main__':
    app.run(debug=True, host=HOST, port=PORT)
"#
    )
}

fn run_site_py() -> String {
    format!(
        r#"from app import app, HOST, PORT

if __name__ == '__main__':
    print(f'Running http://{{HOST}}:{{PORT}}')
    app.run(debug=True, host=HOST, port=PORT)
"#
    )
}

/// Files written for a new site bound to `port`.
pub fn scaffold_files(name: &str, port: u16) -> Vec<ScaffoldFile> {
    vec![
        ScaffoldFile {
            rel_path: "static/css/style.css",
            contents: STYLE_CSS.to_string(),
        },
        ScaffoldFile {
            rel_path: "templates/index.html",
            contents: index_html(name),
        },
        ScaffoldFile {
            rel_path: "app.py",
            contents: app_py(port),
        },
        ScaffoldFile {
            rel_path: ENTRY_POINT,
            contents: run_site_py(),
        },
    ]
}

pub fn entry_point(site_dir: &Path) -> PathBuf {
    site_dir.join(ENTRY_POINT)
}

/// Creates the directory tree and writes every scaffold file. Stops at the
/// first failure and leaves whatever was already written.
pub fn write_scaffold(site_dir: &Path, name: &str, port: u16) -> anyhow::Result<()> {
    std::fs::create_dir_all(site_dir).context("create site dir")?;
    for dir in SCAFFOLD_DIRS {
        std::fs::create_dir_all(site_dir.join(dir)).with_context(|| format!("create {dir}"))?;
    }
    for file in scaffold_files(name, port) {
        std::fs::write(site_dir.join(file.rel_path), file.contents.as_bytes())
            .with_context(|| format!("write {}", file.rel_path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_binds_assigned_port_by_default() {
        let files = scaffold_files("blog", 5007);
        let app = files.iter().find(|f| f.rel_path == "app.py").unwrap();
        assert!(app.contents.contains("os.environ.get('SITE_PORT', '5007')"));
        assert!(app.contents.contains("HOST = '127.0.0.1'"));
    }

    #[test]
    fn run_script_prints_url() {
        let files = scaffold_files("blog", 5007);
        let run = files.iter().find(|f| f.rel_path == ENTRY_POINT).unwrap();
        assert!(run.contents.contains("print(f'Running http://{HOST}:{PORT}')"));
    }

    #[test]
    fn template_references_stylesheet_and_name() {
        let files = scaffold_files("blog", 5000);
        let html = files.iter().find(|f| f.rel_path == "templates/index.html").unwrap();
        assert!(html.contents.contains("<title>blog</title>"));
        assert!(html.contents.contains(r#"{{ url_for("static", filename="css/style.css") }}"#));
    }

    #[test]
    fn write_scaffold_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("blog");
        write_scaffold(&dir, "blog", 5000).unwrap();
        assert!(dir.join("static/css/style.css").is_file());
        assert!(dir.join("templates/index.html").is_file());
        assert!(dir.join("app.py").is_file());
        assert!(entry_point(&dir).is_file());
    }
}
