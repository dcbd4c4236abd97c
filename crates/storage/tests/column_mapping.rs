use smartd_storage::Column;

#[test]
fn column_indexes_are_dense_and_stable() {
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
    }
}

#[test]
fn column_names_are_unique() {
    let mut seen = std::collections::HashSet::new();
    for column in Column::ALL {
        assert!(seen.insert(column.as_str()), "duplicate name {column:?}");
    }
    assert_eq!(seen.len(), Column::ALL.len());
}
