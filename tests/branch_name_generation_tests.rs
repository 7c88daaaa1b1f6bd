use proptest::prelude::*;
use rec_deploy::git::{branch_prefix, generate_branch_name, is_branch_for};
use std::collections::HashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_names_are_unique() {
    let handles: Vec<_> = (0..1000)
        .map(|_| tokio::spawn(async { generate_branch_name("Add FG% calculation") }))
        .collect();

    let mut names = HashSet::new();
    for handle in futures::future::join_all(handles).await {
        let name = handle.unwrap();
        assert!(name.starts_with("feature/add-fg-calculation-"));
        assert!(names.insert(name), "duplicate branch name generated");
    }
    assert_eq!(names.len(), 1000);
}

#[test]
fn test_prefix_for_unsluggable_title() {
    assert_eq!(branch_prefix("%%%"), "feature/recommendation-");
}

proptest! {
    #[test]
    fn prop_names_are_git_safe(title in "\\PC{0,80}") {
        let name = generate_branch_name(&title);
        prop_assert!(name.starts_with("feature/"));
        prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '/'));
        prop_assert!(!name.contains("--"));
        prop_assert!(!name.ends_with('-'));
    }

    #[test]
    fn prop_generated_name_belongs_to_its_title(title in "[A-Za-z0-9 %:_-]{1,60}") {
        let name = generate_branch_name(&title);
        prop_assert!(name.starts_with(&branch_prefix(&title)));
        prop_assert!(is_branch_for(&title, &name));
    }

    #[test]
    fn prop_longer_title_does_not_match(word in "[a-z]{2,10}") {
        let base = "Add rebound rate";
        let longer = format!("{base} {word}");
        let name = generate_branch_name(&longer);
        prop_assert!(!is_branch_for(base, &name));
    }
}
