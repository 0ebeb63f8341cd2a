//! Storage builtins: thin, credential-scoped calls into the file store.

use glob::Pattern;
use ratio_types::error::StorageError;
use ratio_types::value::Value;

use super::builtins::spec;
use super::registry::{Args, FunctionSpec, Param};
use super::{FunctionContext, TransformError};

pub(super) fn catalog() -> Vec<FunctionSpec> {
    vec![
        spec("list_files", const { &[Param::required("directory_path"), Param::optional("pattern")] }, list_files),
        spec("list_file_versions", const { &[Param::required("file_path")] }, list_file_versions),
        spec(
            "describe_version",
            const { &[Param::required("file_path"), Param::optional("version_id")] },
            describe_version,
        ),
        spec("read_file", const { &[Param::required("file_path"), Param::optional("version_id")] }, read_file),
        spec("read_files", const { &[Param::required("file_paths")] }, read_files),
    ]
}

fn storage(args: &Args) -> impl Fn(StorageError) -> TransformError + '_ {
    move |source| TransformError::Storage {
        function: args.function().to_string(),
        source,
    }
}

fn list_files(args: &mut Args, ctx: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let directory = args.take_string("directory_path")?;
    let pattern = args
        .take_optional_string("pattern")?
        .map(|p| Pattern::new(&p).map_err(|e| args.fail(format!("invalid pattern '{p}': {e}"))))
        .transpose()?;

    let mut paths: Vec<Value> = ctx
        .files
        .list(&directory)
        .map_err(storage(args))?
        .into_iter()
        .filter(|meta| pattern.as_ref().is_none_or(|p| p.matches(&meta.file_name)))
        .map(|meta| Value::String(meta.path))
        .collect();

    let limit = ctx.limits.list_files;
    if paths.len() > limit {
        tracing::warn!(
            directory = %directory,
            found = paths.len(),
            limit,
            "list_files result truncated"
        );
        paths.truncate(limit);
    }
    Ok(Value::List(paths))
}

fn list_file_versions(args: &mut Args, ctx: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let path = args.take_string("file_path")?;
    let versions = ctx.files.versions(&path).map_err(storage(args))?;
    Ok(Value::List(versions.iter().map(|v| v.to_value()).collect()))
}

fn describe_version(args: &mut Args, ctx: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let path = args.take_string("file_path")?;
    let version = args.take_optional_string("version_id")?;
    let meta = ctx
        .files
        .describe(&path, version.as_deref())
        .map_err(storage(args))?;
    Ok(meta.to_value())
}

fn read_file(args: &mut Args, ctx: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let path = args.take_string("file_path")?;
    let version = args.take_optional_string("version_id")?;
    ctx.files
        .read(&path, version.as_deref())
        .map(Value::String)
        .map_err(storage(args))
}

fn read_files(args: &mut Args, ctx: &FunctionContext<'_>) -> Result<Value, TransformError> {
    let paths = args.take_list("file_paths")?;
    let limit = ctx.limits.read_files;
    if paths.len() > limit {
        return Err(args.fail(format!(
            "at most {limit} files can be read at once, got {}",
            paths.len()
        )));
    }
    let mut contents = Vec::with_capacity(paths.len());
    for path in &paths {
        let path = path
            .as_str()
            .ok_or_else(|| args.fail(format!("file paths must be strings, got {}", path.kind())))?;
        contents.push(Value::String(ctx.files.read(path, None).map_err(storage(args))?));
    }
    Ok(Value::List(contents))
}

#[cfg(test)]
mod tests {
    use ratio_types::storage::AccessToken;
    use serde_json::json;

    use super::*;
    use crate::reference::testing::object;
    use crate::storage::FileAccess;
    use crate::storage::access::testing::MockStore;
    use crate::transform::{Evaluator, Registry, TransformLimits};

    fn store() -> MockStore {
        MockStore::default()
            .with_file("/docs/a.md", "alpha")
            .with_file("/docs/b.md", "bravo")
            .with_file("/docs/c.txt", "charlie")
    }

    fn eval_with(
        store: &MockStore,
        token: Option<&AccessToken>,
        limits: TransformLimits,
        source: &str,
    ) -> Result<Value, TransformError> {
        let registry = Registry::with_builtins()?;
        let files = FileAccess::new(Some(store), token);
        let ctx = FunctionContext { files: &files, limits };
        Evaluator::new(&registry, &ctx).evaluate_str(source, &object(json!({})))
    }

    fn eval(store: &MockStore, source: &str) -> Result<Value, TransformError> {
        let token = AccessToken::new("t");
        eval_with(store, Some(&token), TransformLimits::default(), source)
    }

    #[test]
    fn list_files_with_pattern_and_limit() {
        let s = store();
        assert_eq!(
            eval(&s, "list_files('/docs', '*.md')").unwrap(),
            Value::from(json!(["/docs/a.md", "/docs/b.md"]))
        );
        let token = AccessToken::new("t");
        let capped = TransformLimits { list_files: 2, read_files: 5 };
        assert_eq!(
            eval_with(&s, Some(&token), capped, "list_files('/docs')").unwrap().as_list().unwrap().len(),
            2
        );
        assert!(eval(&s, "list_files('/docs', '[')").is_err());
    }

    #[test]
    fn read_and_describe() {
        let s = store();
        assert_eq!(eval(&s, "read_file('/docs/c.txt')").unwrap(), Value::from("charlie"));
        let meta = eval(&s, "describe_version('/docs/a.md', 'v1')").unwrap();
        assert_eq!(meta.get_path("file_name"), Some(&Value::from("a.md")));
        let versions = eval(&s, "list_file_versions(file_path='/docs/a.md')").unwrap();
        assert_eq!(versions.get_path("0.version_id"), Some(&Value::from("v1")));
    }

    #[test]
    fn read_files_respects_limit() {
        let s = store();
        assert_eq!(
            eval(&s, "read_files(['/docs/a.md', '/docs/b.md'])").unwrap(),
            Value::from(json!(["alpha", "bravo"]))
        );
        let token = AccessToken::new("t");
        let capped = TransformLimits { list_files: 50, read_files: 1 };
        assert!(matches!(
            eval_with(&s, Some(&token), capped, "read_files(['/docs/a.md', '/docs/b.md'])"),
            Err(TransformError::Function { .. })
        ));
    }

    #[test]
    fn storage_errors_are_reported() {
        let s = store();
        assert!(matches!(
            eval(&s, "read_file('/docs/missing.md')"),
            Err(TransformError::Storage { source: StorageError::NotFound(_), .. })
        ));
        assert!(matches!(
            eval(&s, "read_file('docs/a.md')"),
            Err(TransformError::Storage { source: StorageError::InvalidPath(_), .. })
        ));
        assert!(matches!(
            eval_with(&s, None, TransformLimits::default(), "read_file('/docs/a.md')"),
            Err(TransformError::Storage { source: StorageError::MissingCredential, .. })
        ));
    }
}
