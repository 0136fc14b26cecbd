//! Dev-server profiles for live-dev sessions.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::models::EnvMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framework {
    NextJs,
    Vite,
    Node,
    Django,
    Flask,
    FastApi,
    Go,
    Rails,
    Static,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameworkProfile {
    pub framework: Framework,
    pub image: &'static str,
    pub default_port: u16,
    pub workdir: &'static str,
    pub install: &'static str,
    pub dev: &'static str,
    pub env: EnvMap,
}

impl FrameworkProfile {
    /// Install and dev server in one shell so they share the environment.
    pub fn command(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("{} && {}", self.install, self.dev),
        ]
    }
}

impl Framework {
    pub const ALL: [Framework; 9] = [
        Self::NextJs,
        Self::Vite,
        Self::Node,
        Self::Django,
        Self::Flask,
        Self::FastApi,
        Self::Go,
        Self::Rails,
        Self::Static,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NextJs => "nextjs",
            Self::Vite => "vite",
            Self::Node => "node",
            Self::Django => "django",
            Self::Flask => "flask",
            Self::FastApi => "fastapi",
            Self::Go => "go",
            Self::Rails => "rails",
            Self::Static => "static",
        }
    }

    pub fn profile(&self) -> FrameworkProfile {
        let framework = *self;
        let make = |image, default_port, workdir, install, dev, env: &[(&str, &str)]| {
            FrameworkProfile {
                framework,
                image,
                default_port,
                workdir,
                install,
                dev,
                env: env
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            }
        };
        match self {
            Self::NextJs => make(
                "node:20-alpine",
                3000,
                "/app",
                "npm install",
                "npm run dev -- -H 0.0.0.0 -p 3000",
                &[("NODE_ENV", "development"), ("WATCHPACK_POLLING", "true")],
            ),
            Self::Vite => make(
                "node:20-alpine",
                5173,
                "/app",
                "npm install",
                "npm run dev -- --host 0.0.0.0 --port 5173",
                &[("NODE_ENV", "development"), ("CHOKIDAR_USEPOLLING", "true")],
            ),
            Self::Node => make(
                "node:20-alpine",
                3000,
                "/app",
                "npm install",
                "npm run dev --if-present || npm start",
                &[("NODE_ENV", "development"), ("PORT", "3000")],
            ),
            Self::Django => make(
                "python:3.12-slim",
                8000,
                "/app",
                "pip install -r requirements.txt",
                "python manage.py runserver 0.0.0.0:8000",
                &[("PYTHONUNBUFFERED", "1")],
            ),
            Self::Flask => make(
                "python:3.12-slim",
                5000,
                "/app",
                "pip install -r requirements.txt",
                "flask run --host 0.0.0.0 --port 5000 --reload",
                &[("PYTHONUNBUFFERED", "1"), ("FLASK_DEBUG", "1")],
            ),
            Self::FastApi => make(
                "python:3.12-slim",
                8000,
                "/app",
                "pip install -r requirements.txt",
                "uvicorn main:app --host 0.0.0.0 --port 8000 --reload",
                &[("PYTHONUNBUFFERED", "1")],
            ),
            Self::Go => make(
                "golang:1.22-alpine",
                8080,
                "/app",
                "go mod download",
                "go run .",
                &[("PORT", "8080")],
            ),
            Self::Rails => make(
                "ruby:3.3",
                3000,
                "/app",
                "bundle install",
                "bin/rails server -b 0.0.0.0 -p 3000",
                &[("RAILS_ENV", "development")],
            ),
            Self::Static => make(
                "nginx:alpine",
                80,
                "/usr/share/nginx/html",
                "true",
                "nginx -g 'daemon off;'",
                &[],
            ),
        }
    }

    /// Guess the framework from marker files in `dir`. Falls back to `Static`.
    pub fn detect(dir: &Path) -> Framework {
        let read = |name: &str| std::fs::read_to_string(dir.join(name)).unwrap_or_default();
        let has = |name: &str| dir.join(name).exists();
        let has_any = |names: &[&str]| names.iter().any(|n| has(n));

        if has("package.json") {
            let package = read("package.json");
            if has_any(&["next.config.js", "next.config.mjs", "next.config.ts"])
                || package.contains("\"next\"")
            {
                return Self::NextJs;
            }
            if has_any(&["vite.config.js", "vite.config.ts", "vite.config.mjs"])
                || package.contains("\"vite\"")
            {
                return Self::Vite;
            }
            return Self::Node;
        }
        if has("manage.py") {
            return Self::Django;
        }
        let requirements = read("requirements.txt").to_ascii_lowercase();
        if requirements.contains("fastapi") {
            return Self::FastApi;
        }
        if requirements.contains("flask") {
            return Self::Flask;
        }
        if has("Gemfile") && read("Gemfile").contains("rails") {
            return Self::Rails;
        }
        if has("go.mod") {
            return Self::Go;
        }
        Self::Static
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let alias = match lower.as_str() {
            "next" | "next.js" => "nextjs",
            "express" | "nodejs" => "node",
            "golang" => "go",
            "html" => "static",
            other => other,
        };
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == alias)
            .ok_or_else(|| format!("Unsupported framework: {}", s))
    }
}
