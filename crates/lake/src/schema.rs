diesel::table! {
	eras (era_id) {
		era_id -> Text,
		version_label -> Text,
		network -> Text,
		ledger_start -> BigInt,
		ledger_end -> Nullable<BigInt>,
		status -> Text,
	}
}

diesel::table! {
	datasets (name) {
		name -> Text,
		major_version -> Integer,
		minor_version -> Integer,
		schema_hash -> Text,
		grain -> Text,
		owner -> Text,
	}
}

diesel::table! {
	lineage (dataset, era_id, snapshot_id) {
		dataset -> Text,
		era_id -> Text,
		version_label -> Text,
		source_ledger_start -> BigInt,
		source_ledger_end -> BigInt,
		partition -> Integer,
		file_path -> Text,
		file_bytes -> BigInt,
		row_count -> BigInt,
		checksum -> Text,
		snapshot_id -> BigInt,
		created_at -> Timestamptz,
	}
}

diesel::allow_tables_to_appear_in_same_query!(eras, datasets, lineage);
