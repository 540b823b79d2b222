use tessera_core::{ForeignKeyDescriptor, IndexDescriptor, Property, Schema, StoreError, StoreResult};

use super::SqlTranslator;

impl SqlTranslator {
    fn column_definition(&self, property: &Property) -> StoreResult<String> {
        let ty = self.dialect.column_type(property).ok_or_else(|| {
            StoreError::unsupported(format!(
                "{} column '{}' on {}",
                property.logical_type,
                property.name,
                self.dialect.name()
            ))
        })?;
        let nullability = if property.required { "NOT NULL" } else { "NULL" };
        Ok(format!("{} {ty} {nullability}", self.dialect.quote(&property.dbname)))
    }

    fn foreign_key_clause(&self, schema: &Schema, foreign_key: &ForeignKeyDescriptor) -> StoreResult<String> {
        let column = schema
            .property(&foreign_key.column)
            .ok_or_else(|| StoreError::UnknownColumn(foreign_key.column.clone()))?;
        Ok(format!(
            "FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE {}",
            self.dialect.quote(&column.dbname),
            self.dialect.quote(&foreign_key.references),
            self.dialect.quote("id"),
            foreign_key.on_delete.sql()
        ))
    }

    /// `CREATE TABLE IF NOT EXISTS` with every column of the schema.
    pub fn create_table(&self, schema: &Schema) -> StoreResult<String> {
        let mut definitions = vec![self.dialect.primary_key_column()];
        for property in schema.properties() {
            definitions.push(self.column_definition(property)?);
        }
        if self.dialect.inline_foreign_keys() {
            for foreign_key in schema.foreign_keys() {
                definitions.push(self.foreign_key_clause(schema, foreign_key)?);
            }
        }
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({}){}",
            self.table(schema),
            definitions.join(", "),
            self.dialect.table_options()
        ))
    }

    pub fn add_column(&self, schema: &Schema, property: &Property) -> StoreResult<String> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.table(schema),
            self.column_definition(property)?
        ))
    }

    pub fn create_index(&self, schema: &Schema, index: &IndexDescriptor) -> StoreResult<String> {
        let mut columns = Vec::with_capacity(index.columns.len());
        for (name, direction) in &index.columns {
            let column = match schema.property(name) {
                Some(property) => self.dialect.quote(&property.dbname),
                None if name == tessera_core::ID_FIELD => self.dialect.quote("id"),
                None => return Err(StoreError::UnknownColumn(name.clone())),
            };
            columns.push(format!("{column} {}", direction.sql()));
        }
        Ok(format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.dialect.quote(&index.name),
            self.table(schema),
            columns.join(", ")
        ))
    }

    /// `ALTER TABLE ... ADD CONSTRAINT`; `None` where keys are declared inline.
    pub fn create_foreign_key(
        &self,
        schema: &Schema,
        foreign_key: &ForeignKeyDescriptor,
    ) -> StoreResult<Option<String>> {
        if self.dialect.inline_foreign_keys() {
            return Ok(None);
        }
        let constraint = format!("{}_{}_fkey", schema.table(), foreign_key.column.replace('.', "_"));
        Ok(Some(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            self.table(schema),
            self.dialect.quote(&constraint),
            self.foreign_key_clause(schema, foreign_key)?
        )))
    }

    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.dialect.quote(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{MySqlDialect, PostgresDialect, SqliteDialect};
    use tessera_core::{Capabilities, LogicalType, OnDelete, SortDirection};

    fn posts(capabilities: &Capabilities) -> Schema {
        Schema::builder("posts")
            .property(Property::new("title", LogicalType::String { max_len: Some(80) }).required())
            .column("author", LogicalType::RecordId)
            .column("meta.lang", LogicalType::STRING)
            .index(IndexDescriptor::new(["title"]).unique().direction("title", SortDirection::Desc))
            .foreign_key(ForeignKeyDescriptor::new("author", "users", OnDelete::Delete))
            .build(capabilities)
            .unwrap()
    }

    #[test]
    fn test_create_table_sqlite_inlines_foreign_keys() {
        let sql = SqlTranslator::new(SqliteDialect)
            .create_table(&posts(&Capabilities::sqlite()))
            .unwrap();

        assert_eq!(
            sql,
            concat!(
                r#"CREATE TABLE IF NOT EXISTS "posts" ("id" INTEGER PRIMARY KEY AUTOINCREMENT, "#,
                r#""title" VARCHAR(80) NOT NULL, "author" INTEGER NULL, "meta_lang" VARCHAR(255) NULL, "#,
                r#"FOREIGN KEY ("author") REFERENCES "users"("id") ON DELETE CASCADE)"#
            )
        );
    }

    #[test]
    fn test_mysql_table_options_and_alter_foreign_key() {
        let translator = SqlTranslator::new(MySqlDialect::default());
        let schema = posts(&Capabilities::mysql());

        assert!(translator
            .create_table(&schema)
            .unwrap()
            .ends_with(") DEFAULT CHARSET=utf8 COLLATE=utf8_unicode_ci"));
        assert_eq!(
            translator
                .create_foreign_key(&schema, &schema.foreign_keys()[0])
                .unwrap()
                .unwrap(),
            "ALTER TABLE `posts` ADD CONSTRAINT `posts_author_fkey` FOREIGN KEY (`author`) REFERENCES `users`(`id`) ON DELETE CASCADE"
        );
    }

    #[test]
    fn test_create_index() {
        let schema = posts(&Capabilities::postgres());

        let sql = SqlTranslator::new(PostgresDialect)
            .create_index(&schema, &schema.indexes()[0])
            .unwrap();

        assert_eq!(sql, r#"CREATE UNIQUE INDEX "title" ON "posts" ("title" DESC)"#);
    }

    #[test]
    fn test_unstorable_column_is_unsupported() {
        let schema = posts(&Capabilities::sqlite());
        let point = Property::new("at", LogicalType::GeoPoint);

        assert!(matches!(
            SqlTranslator::new(SqliteDialect).add_column(&schema, &point),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn test_drop_table() {
        assert_eq!(
            SqlTranslator::new(SqliteDialect).drop_table("posts"),
            r#"DROP TABLE IF EXISTS "posts""#
        );
    }
}
