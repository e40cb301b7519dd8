use crate::bail;
use crate::error::{ErrorKind, ShiftResult};
use crate::schema::alter::{AlterOperation, AlterTable};
use crate::schema::ddl::lexer::{Token, tokenize};
use crate::schema::table::{
    ColumnSchema, ColumnType, DefaultValue, IndexSchema, IntegerWidth, Literal, TableSchema,
};

/// Parses an `ALTER TABLE` statement into the list of operations it performs.
pub fn parse_alter_table(sql: &str) -> ShiftResult<AlterTable> {
    let mut parser = Parser::new(sql)?;

    parser.expect_keyword("ALTER")?;
    parser.expect_keyword("TABLE")?;
    let table = parser.table_name()?;

    let mut operations = vec![parser.alter_operation()?];
    while parser.eat(&Token::Comma) {
        operations.push(parser.alter_operation()?);
    }
    parser.expect_end()?;

    Ok(AlterTable { table, operations })
}

/// Parses a `CREATE TABLE` statement into a validated [`TableSchema`].
///
/// Table options following the column list, such as `ENGINE=InnoDB`, are ignored.
pub fn parse_create_table(sql: &str) -> ShiftResult<TableSchema> {
    let mut parser = Parser::new(sql)?;

    parser.expect_keyword("CREATE")?;
    parser.expect_keyword("TABLE")?;
    if parser.eat_keyword("IF") {
        parser.expect_keyword("NOT")?;
        parser.expect_keyword("EXISTS")?;
    }
    let name = parser.table_name()?;

    let mut columns = Vec::new();
    let mut primary_key = Vec::new();
    let mut indexes = Vec::new();

    parser.expect(&Token::LParen)?;
    loop {
        if parser.eat_keyword("PRIMARY") {
            parser.expect_keyword("KEY")?;
            if !primary_key.is_empty() {
                bail!(
                    ErrorKind::ValidationError,
                    "Multiple primary keys defined",
                    format!("table `{name}`")
                );
            }
            primary_key = parser.column_list()?;
        } else if parser.peek_keyword("UNIQUE")
            || parser.peek_keyword("KEY")
            || parser.peek_keyword("INDEX")
        {
            parser.eat_keyword("UNIQUE");
            if !parser.eat_keyword("KEY") {
                parser.eat_keyword("INDEX");
            }
            let index_name = parser.identifier()?;
            let index_columns = parser.column_list()?;
            indexes.push(IndexSchema {
                name: index_name,
                columns: index_columns,
            });
        } else {
            let (column, is_key) = parser.column_definition()?;
            if is_key {
                primary_key.push(column.name.clone());
            }
            columns.push(column);
        }

        if !parser.eat(&Token::Comma) {
            break;
        }
    }
    parser.expect(&Token::RParen)?;

    // Table options are not part of the schema model.
    while !parser.at_end() {
        parser.next();
    }

    TableSchema::new(name, columns, primary_key, indexes)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(sql: &str) -> ShiftResult<Self> {
        let mut tokens = tokenize(sql)?;
        while tokens.last() == Some(&Token::Semicolon) {
            tokens.pop();
        }

        Ok(Self { tokens, pos: 0 })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }

        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn describe_next(&self) -> String {
        match self.peek() {
            Some(token) => format!("found {token:?} at token {}", self.pos),
            None => "found end of statement".to_owned(),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|token| token.is_keyword(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            return true;
        }

        false
    }

    fn expect_keyword(&mut self, keyword: &str) -> ShiftResult<()> {
        if self.eat_keyword(keyword) {
            return Ok(());
        }

        bail!(
            ErrorKind::ValidationError,
            "Unexpected token in statement",
            format!("expected {keyword}, {}", self.describe_next())
        );
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            return true;
        }

        false
    }

    fn expect(&mut self, expected: &Token) -> ShiftResult<()> {
        if self.eat(expected) {
            return Ok(());
        }

        bail!(
            ErrorKind::ValidationError,
            "Unexpected token in statement",
            format!("expected {expected:?}, {}", self.describe_next())
        );
    }

    fn expect_end(&self) -> ShiftResult<()> {
        if self.at_end() {
            return Ok(());
        }

        bail!(
            ErrorKind::ValidationError,
            "Unexpected trailing tokens in statement",
            self.describe_next()
        );
    }

    fn identifier(&mut self) -> ShiftResult<String> {
        match self.peek() {
            Some(Token::Word(word)) | Some(Token::QuotedIdent(word)) => {
                let word = word.clone();
                self.pos += 1;
                Ok(word)
            }
            _ => bail!(
                ErrorKind::ValidationError,
                "Expected an identifier",
                self.describe_next()
            ),
        }
    }

    /// Parses a possibly qualified table name, keeping only the table part.
    fn table_name(&mut self) -> ShiftResult<String> {
        let mut name = self.identifier()?;
        if self.eat(&Token::Dot) {
            name = self.identifier()?;
        }

        Ok(name)
    }

    fn column_list(&mut self) -> ShiftResult<Vec<String>> {
        self.expect(&Token::LParen)?;
        let mut columns = vec![self.identifier()?];
        self.skip_prefix_length()?;
        while self.eat(&Token::Comma) {
            columns.push(self.identifier()?);
            self.skip_prefix_length()?;
        }
        self.expect(&Token::RParen)?;

        Ok(columns)
    }

    /// Skips an index prefix length such as the `(10)` in `KEY k (name(10))`.
    fn skip_prefix_length(&mut self) -> ShiftResult<()> {
        if self.eat(&Token::LParen) {
            self.number()?;
            self.expect(&Token::RParen)?;
        }

        Ok(())
    }

    fn number(&mut self) -> ShiftResult<String> {
        match self.peek() {
            Some(Token::Number(number)) => {
                let number = number.clone();
                self.pos += 1;
                Ok(number)
            }
            _ => bail!(
                ErrorKind::ValidationError,
                "Expected a number",
                self.describe_next()
            ),
        }
    }

    fn length(&mut self) -> ShiftResult<u32> {
        let number = self.number()?;
        match number.parse::<u32>() {
            Ok(length) => Ok(length),
            Err(_) => bail!(
                ErrorKind::ValidationError,
                "Invalid type length",
                format!("'{number}'")
            ),
        }
    }

    /// Parses an optional `(n)` or `(p, s)` type modifier.
    fn optional_modifier(&mut self) -> ShiftResult<Option<u32>> {
        if !self.eat(&Token::LParen) {
            return Ok(None);
        }

        let length = self.length()?;
        if self.eat(&Token::Comma) {
            self.length()?;
        }
        self.expect(&Token::RParen)?;

        Ok(Some(length))
    }

    fn column_type(&mut self) -> ShiftResult<ColumnType> {
        let Some(Token::Word(name)) = self.peek().cloned() else {
            bail!(
                ErrorKind::ValidationError,
                "Expected a column type",
                self.describe_next()
            );
        };
        self.pos += 1;

        let width = match name.to_lowercase().as_str() {
            "tinyint" => Some(IntegerWidth::Tiny),
            "smallint" => Some(IntegerWidth::Small),
            "int" | "integer" => Some(IntegerWidth::Int),
            "bigint" => Some(IntegerWidth::Big),
            _ => None,
        };

        if let Some(width) = width {
            // Display width has no effect on the values a column holds.
            self.optional_modifier()?;
            let unsigned = self.eat_keyword("UNSIGNED");
            if !unsigned {
                self.eat_keyword("SIGNED");
            }

            return Ok(ColumnType::Integer { width, unsigned });
        }

        let ty = match name.to_lowercase().as_str() {
            "varchar" | "char" => {
                let Some(length) = self.optional_modifier()? else {
                    bail!(
                        ErrorKind::ValidationError,
                        "Character column requires a length",
                        format!("type {name}")
                    );
                };
                ColumnType::Varchar(length)
            }
            "text" => ColumnType::Text,
            "timestamp" | "datetime" => {
                self.optional_modifier()?;
                ColumnType::Timestamp
            }
            "bool" | "boolean" => ColumnType::Boolean,
            "double" | "float" | "real" => {
                self.eat_keyword("PRECISION");
                self.optional_modifier()?;
                ColumnType::Double
            }
            _ => bail!(
                ErrorKind::ValidationError,
                "Unsupported column type",
                format!("type {name}")
            ),
        };

        Ok(ty)
    }

    fn literal(&mut self) -> ShiftResult<DefaultValue> {
        if self.at_end() {
            bail!(
                ErrorKind::ValidationError,
                "Expected a literal value",
                self.describe_next()
            );
        }

        let literal = match self.next() {
            Some(Token::StringLit(value)) => Literal::String(value),
            Some(Token::Number(number)) => {
                if let Ok(value) = number.parse::<i128>() {
                    Literal::Integer(value)
                } else if let Ok(value) = number.parse::<f64>() {
                    Literal::Float(value)
                } else {
                    bail!(
                        ErrorKind::ValidationError,
                        "Invalid numeric literal",
                        format!("'{number}'")
                    );
                }
            }
            Some(token) if token.is_keyword("NULL") => Literal::Null,
            Some(token) if token.is_keyword("TRUE") => Literal::Bool(true),
            Some(token) if token.is_keyword("FALSE") => Literal::Bool(false),
            Some(token) if token.is_keyword("CURRENT_TIMESTAMP") || token.is_keyword("NOW") => {
                if self.eat(&Token::LParen) {
                    self.expect(&Token::RParen)?;
                }
                return Ok(DefaultValue::CurrentTimestamp);
            }
            _ => {
                self.pos -= 1;
                bail!(
                    ErrorKind::ValidationError,
                    "Expected a literal value",
                    self.describe_next()
                );
            }
        };

        Ok(DefaultValue::Literal(literal))
    }

    /// Parses `<name> <type> [attributes]`, returning whether the column was declared as the
    /// primary key inline.
    fn column_definition(&mut self) -> ShiftResult<(ColumnSchema, bool)> {
        let name = self.identifier()?;
        let ty = self.column_type()?;

        let mut column = ColumnSchema::new(name, ty);
        let mut is_key = false;
        loop {
            if self.eat_keyword("NOT") {
                self.expect_keyword("NULL")?;
                column.nullable = false;
            } else if self.eat_keyword("NULL") {
                column.nullable = true;
            } else if self.eat_keyword("DEFAULT") {
                column.default = Some(self.literal()?);
            } else if self.eat_keyword("PRIMARY") {
                self.expect_keyword("KEY")?;
                column.nullable = false;
                is_key = true;
            } else if self.eat_keyword("COMMENT") {
                self.literal()?;
            } else {
                break;
            }
        }

        // An explicit NULL default only makes sense on a nullable column.
        if !column.nullable && column.default == Some(DefaultValue::Literal(Literal::Null)) {
            bail!(
                ErrorKind::ValidationError,
                "Invalid default value",
                format!("column `{}` is NOT NULL but defaults to NULL", column.name)
            );
        }

        Ok((column, is_key))
    }

    fn alter_operation(&mut self) -> ShiftResult<AlterOperation> {
        if self.eat_keyword("ADD") {
            if self.eat_keyword("INDEX") || self.eat_keyword("KEY") {
                let name = self.identifier()?;
                let columns = self.column_list()?;
                return Ok(AlterOperation::AddIndex(IndexSchema { name, columns }));
            }

            self.eat_keyword("COLUMN");
            let (column, is_key) = self.column_definition()?;
            if is_key {
                bail!(
                    ErrorKind::ValidationError,
                    "Changing the primary key is not supported",
                    format!("column `{}`", column.name)
                );
            }
            return Ok(AlterOperation::AddColumn(column));
        }

        if self.eat_keyword("DROP") {
            if self.eat_keyword("INDEX") || self.eat_keyword("KEY") {
                return Ok(AlterOperation::DropIndex(self.identifier()?));
            }
            if self.peek_keyword("PRIMARY") {
                bail!(
                    ErrorKind::ValidationError,
                    "Changing the primary key is not supported"
                );
            }

            self.eat_keyword("COLUMN");
            return Ok(AlterOperation::DropColumn(self.identifier()?));
        }

        if self.eat_keyword("MODIFY") {
            self.eat_keyword("COLUMN");
            let (column, _) = self.column_definition()?;
            return Ok(AlterOperation::ModifyColumn(column));
        }

        if self.eat_keyword("CHANGE") {
            self.eat_keyword("COLUMN");
            let old = self.identifier()?;
            let (column, _) = self.column_definition()?;
            return Ok(AlterOperation::ChangeColumn { old, column });
        }

        if self.eat_keyword("RENAME") {
            self.expect_keyword("COLUMN")?;
            let from = self.identifier()?;
            self.expect_keyword("TO")?;
            let to = self.identifier()?;
            return Ok(AlterOperation::RenameColumn { from, to });
        }

        if self.eat_keyword("ALTER") {
            self.eat_keyword("COLUMN");
            let column = self.identifier()?;
            if self.eat_keyword("SET") {
                self.expect_keyword("DEFAULT")?;
                let default = self.literal()?;
                return Ok(AlterOperation::SetDefault { column, default });
            }

            self.expect_keyword("DROP")?;
            self.expect_keyword("DEFAULT")?;
            return Ok(AlterOperation::DropDefault { column });
        }

        bail!(
            ErrorKind::ValidationError,
            "Unsupported ALTER TABLE operation",
            self.describe_next()
        );
    }
}
