//! Language detection and Dockerfile generation.
//!
//! Detection only looks at the repository URL, nothing is cloned. When no
//! hint matches, the Go toolchain is assumed.

use anyhow::{bail, Error};

use super::model::{BuildSpec, Language};

pub fn detect_language(repo_url: &str) -> Language {
    let url = repo_url.to_lowercase();
    let has = |hints: &[&str]| hints.iter().any(|hint| url.contains(hint));
    if has(&["go", "golang"]) {
        Language::Go
    } else if has(&["node", "js", "javascript"]) {
        Language::Node
    } else if has(&["python", "py"]) {
        Language::Python
    } else {
        Language::Go
    }
}

/// Port the generated image listens on inside the container.
pub fn exposed_port(language: Language) -> u16 {
    match language {
        Language::Go => 8080,
        Language::Node => 3000,
        Language::Python => 8000,
    }
}

pub fn generate(language: Language, repo_url: &str) -> Result<BuildSpec, Error> {
    if repo_url.is_empty() || repo_url.chars().any(|c| c.is_whitespace() || c == '"') {
        bail!("Repository url {:?} can't be embedded in a Dockerfile", repo_url);
    }
    let port = exposed_port(language);
    let dockerfile = match language {
        Language::Go => format!(
            "FROM golang:1.24-alpine AS builder\n\
             WORKDIR /app\n\
             RUN apk add --no-cache git\n\
             RUN git clone {repo_url} .\n\
             RUN go mod download\n\
             RUN CGO_ENABLED=0 GOOS=linux go build -o main .\n\
             \n\
             FROM alpine:latest\n\
             RUN apk --no-cache add ca-certificates\n\
             WORKDIR /root/\n\
             COPY --from=builder /app/main .\n\
             EXPOSE {port}\n\
             CMD [\"./main\"]\n"
        ),
        Language::Node => format!(
            "FROM node:18-alpine AS builder\n\
             WORKDIR /app\n\
             RUN apk add --no-cache git\n\
             RUN git clone {repo_url} .\n\
             RUN npm ci --omit=dev\n\
             \n\
             FROM node:18-alpine\n\
             WORKDIR /app\n\
             COPY --from=builder /app .\n\
             EXPOSE {port}\n\
             CMD [\"npm\", \"start\"]\n"
        ),
        Language::Python => format!(
            "FROM python:3.11-alpine AS builder\n\
             WORKDIR /app\n\
             RUN apk add --no-cache git\n\
             RUN git clone {repo_url} .\n\
             \n\
             FROM python:3.11-alpine\n\
             WORKDIR /app\n\
             COPY --from=builder /app .\n\
             RUN pip install --no-cache-dir -r requirements.txt\n\
             EXPOSE {port}\n\
             CMD [\"python\", \"app.py\"]\n"
        ),
    };
    Ok(BuildSpec {
        language,
        repo_url: repo_url.to_string(),
        dockerfile,
        exposed_port: port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_family_from_url_hints() {
        assert_eq!(detect_language("https://example.com/foo-go.git"), Language::Go);
        assert_eq!(detect_language("https://example.com/acme/express-node"), Language::Node);
        assert_eq!(detect_language("https://example.com/acme/flask-python"), Language::Python);
    }

    #[test]
    fn unknown_repositories_fall_back_to_go() {
        assert_eq!(detect_language("https://example.com/acme/service"), Language::Go);
        assert_eq!(detect_language(""), Language::Go);
    }

    #[test]
    fn dockerfile_clones_repository_and_exposes_family_port() {
        let spec = generate(Language::Node, "https://example.com/app-node.git").unwrap();
        assert_eq!(spec.exposed_port, 3000);
        assert!(spec.dockerfile.contains("RUN git clone https://example.com/app-node.git ."));
        assert!(spec.dockerfile.contains("EXPOSE 3000"));
    }

    #[test]
    fn rejects_urls_that_would_break_the_dockerfile() {
        assert!(generate(Language::Go, "https://example.com/x\nRUN rm -rf /").is_err());
        assert!(generate(Language::Go, "").is_err());
    }
}
